//! Action gateway: human decisions on low-confidence matches.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::TrackStatus;

use super::manager::BatchManager;

/// Operator decision kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Accept the match (optionally overriding the video id) and queue it.
    Accept,
    /// Throw the match away and run the mapper again.
    Rematch,
    /// Park the track until an explicit accept arrives.
    Manual,
}

impl ActionKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(ActionKind::Accept),
            "rematch" => Some(ActionKind::Rematch),
            "manual" => Some(ActionKind::Manual),
            _ => None,
        }
    }
}

/// Outcome reported back through the facade.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

impl BatchManager {
    /// Apply an operator decision to a track. All rerouting happens
    /// through the normal transition table, so a decision that no longer
    /// applies degrades into an error response instead of corrupting
    /// state.
    pub async fn handle_action(
        self: &Arc<Self>,
        track_id: &str,
        kind: ActionKind,
        video_id: Option<String>,
    ) -> ActionResponse {
        let track = match self.store.get_track(track_id) {
            Ok(Some(track)) => track,
            Ok(None) => return ActionResponse::err("track not found"),
            Err(e) => {
                warn!("Action lookup failed for {}: {:#}", track_id, e);
                return ActionResponse::err("storage error");
            }
        };

        match kind {
            ActionKind::Accept => {
                let Some(video_id) = video_id.or_else(|| track.source_video_id.clone()) else {
                    return ActionResponse::err("accept requires a video id");
                };

                let matched = self
                    .transition(track_id, TrackStatus::Matched, |t| {
                        t.source_video_id = Some(video_id.clone());
                        t.match_confidence = Some(1.0);
                        t.error_code = None;
                    })
                    .await;
                match matched {
                    Ok(Some(_)) => {}
                    Ok(None) => return ActionResponse::err("track is not awaiting a decision"),
                    Err(e) => {
                        warn!("Accept failed for {}: {:#}", track_id, e);
                        return ActionResponse::err("storage error");
                    }
                }

                match self.transition(track_id, TrackStatus::Queued, |_| {}).await {
                    Ok(Some(queued)) => {
                        if let Some(vid) = &queued.source_video_id {
                            self.resolver.prefetch(vid);
                        }
                        info!("Track {} accepted and queued", track_id);
                        ActionResponse::ok()
                    }
                    Ok(None) => ActionResponse::err("track could not be queued"),
                    Err(e) => {
                        warn!("Queueing after accept failed for {}: {:#}", track_id, e);
                        ActionResponse::err("storage error")
                    }
                }
            }

            ActionKind::Rematch => {
                let rematching = self
                    .transition(track_id, TrackStatus::Matching, |t| {
                        t.error_code = None;
                        t.match_confidence = None;
                    })
                    .await;
                match rematching {
                    Ok(Some(track)) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.resolve_match(&track).await {
                                warn!("Rematch of {} failed: {:#}", track.id, e);
                            }
                        });
                        info!("Track {} sent back to matching", track_id);
                        ActionResponse::ok()
                    }
                    Ok(None) => ActionResponse::err("track cannot be rematched"),
                    Err(e) => {
                        warn!("Rematch failed for {}: {:#}", track_id, e);
                        ActionResponse::err("storage error")
                    }
                }
            }

            ActionKind::Manual => {
                match self
                    .transition(track_id, TrackStatus::MatchingManual, |_| {})
                    .await
                {
                    Ok(Some(_)) => {
                        info!("Track {} handed off to manual matching", track_id);
                        ActionResponse::ok()
                    }
                    Ok(None) => ActionResponse::err("track cannot go manual"),
                    Err(e) => {
                        warn!("Manual hand-off failed for {}: {:#}", track_id, e);
                        ActionResponse::err("storage error")
                    }
                }
            }
        }
    }
}
