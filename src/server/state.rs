use axum::extract::FromRef;
use std::sync::Arc;

use crate::orchestrator::BatchManager;
use crate::video_platform::VideoApiClient;

use super::tasks::TaskRegistry;

#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<BatchManager>,
    pub tasks: Arc<TaskRegistry>,
    pub search_api: VideoApiClient,
}

impl FromRef<ServerState> for Arc<BatchManager> {
    fn from_ref(input: &ServerState) -> Self {
        input.manager.clone()
    }
}

impl FromRef<ServerState> for Arc<TaskRegistry> {
    fn from_ref(input: &ServerState) -> Self {
        input.tasks.clone()
    }
}

impl FromRef<ServerState> for VideoApiClient {
    fn from_ref(input: &ServerState) -> Self {
        input.search_api.clone()
    }
}
