//! In-memory registry for on-demand single-song downloads.
//!
//! Each `/api/download` call creates a task whose lifecycle is polled via
//! `/api/progress/{id}`. A single-song download is a batch of one in
//! spirit, but it bypasses the store: nothing about it needs to survive a
//! restart, the UI just re-submits.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::downloader::{ResumeEvent, ResumingDownloader};
use crate::fingerprint::sanitize_filename;
use crate::resolver::StreamResolver;

/// Task progress states surfaced to the UI. `Converting` is accepted for
/// compatibility but never produced, audio is stored as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Extracting,
    Downloading,
    Paused,
    Converting,
    Done,
    Error,
}

/// Snapshot of one task, shaped for the progress endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskSnapshot {
    fn new() -> Self {
        Self {
            status: TaskStatus::Extracting,
            percent: 0,
            result: None,
            error: None,
        }
    }
}

/// Registry of single-song download tasks.
pub struct TaskRegistry {
    resolver: StreamResolver,
    downloader: ResumingDownloader,
    music_dir: PathBuf,
    tasks: Mutex<HashMap<String, TaskSnapshot>>,
}

impl TaskRegistry {
    pub fn new(resolver: StreamResolver, downloader: ResumingDownloader, music_dir: PathBuf) -> Self {
        Self {
            resolver,
            downloader,
            music_dir,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    fn update<F: FnOnce(&mut TaskSnapshot)>(&self, task_id: &str, mutate: F) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(snapshot) = tasks.get_mut(task_id) {
            mutate(snapshot);
        }
    }

    /// Start a download task for a watch URL; returns the task id.
    pub fn start(self: &Arc<Self>, url: String, title: String, codec: String) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.tasks
            .lock()
            .unwrap()
            .insert(task_id.clone(), TaskSnapshot::new());

        let registry = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            registry.run(id, url, title, codec).await;
        });

        task_id
    }

    async fn run(self: Arc<Self>, task_id: String, url: String, title: String, codec: String) {
        let Some(video_id) = video_id_from_url(&url) else {
            self.update(&task_id, |t| {
                t.status = TaskStatus::Error;
                t.error = Some("unsupported URL".to_string());
            });
            return;
        };

        let ext = match codec.as_str() {
            "opus" | "ogg" | "mp3" => codec.as_str(),
            _ => "mp3",
        };
        let stem = sanitize_filename(&title);
        let stem = if stem.is_empty() { video_id.clone() } else { stem };
        let filename = format!("{}.{}", stem, ext);
        let dest = self.music_dir.join(&filename);

        if let Err(e) = tokio::fs::create_dir_all(&self.music_dir).await {
            self.update(&task_id, |t| {
                t.status = TaskStatus::Error;
                t.error = Some(e.to_string());
            });
            return;
        }

        self.update(&task_id, |t| t.status = TaskStatus::Downloading);

        let events_registry = self.clone();
        let events_task_id = task_id.clone();
        let result = self
            .downloader
            .download(&self.resolver, &video_id, &dest, move |event| match event {
                ResumeEvent::Progress(percent) => {
                    events_registry.update(&events_task_id, |t| {
                        t.status = TaskStatus::Downloading;
                        t.percent = percent;
                    });
                }
                ResumeEvent::Paused { retry_in } => {
                    events_registry.update(&events_task_id, |t| {
                        t.status = TaskStatus::Paused;
                        t.error = Some(format!("retrying in {}s", retry_in.as_secs()));
                    });
                }
            })
            .await;

        match result {
            Ok(bytes) => {
                info!("Task {} finished: {} ({} bytes)", task_id, filename, bytes);
                self.update(&task_id, |t| {
                    t.status = TaskStatus::Done;
                    t.percent = 100;
                    t.result = Some(filename);
                    t.error = None;
                });
            }
            Err(e) => {
                warn!("Task {} failed: {}", task_id, e);
                self.update(&task_id, |t| {
                    t.status = TaskStatus::Error;
                    t.error = Some(e.to_string());
                });
            }
        }
    }
}

/// Extract a video id from a watch URL or bare id.
pub fn video_id_from_url(url: &str) -> Option<String> {
    if let Some(idx) = url.find("v=") {
        let rest = &url[idx + 2..];
        let end = rest.find('&').unwrap_or(rest.len());
        if end > 0 {
            return Some(rest[..end].to_string());
        }
        return None;
    }
    if !url.contains('/') && !url.contains(':') && !url.is_empty() {
        return Some(url.to_string());
    }
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains('.') && !s.contains(':'))
        .map(|s| s.split('?').next().unwrap_or(s).to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_client;
    use crate::video_platform::VideoApiClient;

    fn registry() -> Arc<TaskRegistry> {
        let client = build_client();
        let api = VideoApiClient::new(client.clone(), "http://127.0.0.1:1/api");
        Arc::new(TaskRegistry::new(
            StreamResolver::new(client.clone(), api, vec![]),
            ResumingDownloader::new(client),
            std::env::temp_dir(),
        ))
    }

    #[test]
    fn test_video_id_from_url() {
        assert_eq!(
            video_id_from_url("https://tube.example/watch?v=abc12").as_deref(),
            Some("abc12")
        );
        assert_eq!(
            video_id_from_url("https://tube.example/watch?v=abc12&t=9").as_deref(),
            Some("abc12")
        );
        assert_eq!(video_id_from_url("abc12").as_deref(), Some("abc12"));
        assert_eq!(
            video_id_from_url("https://tube.example/embed/abc12").as_deref(),
            Some("abc12")
        );
        assert_eq!(video_id_from_url(""), None);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let registry = registry();
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_task_with_bad_url_errors() {
        let registry = registry();
        let task_id = registry.start("https://".to_string(), "T".to_string(), "mp3".to_string());

        // The spawned task settles quickly since there is no network work.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(snapshot) = registry.get(&task_id) {
                if snapshot.status == TaskStatus::Error {
                    return;
                }
            }
        }
        panic!("task never reached Error state");
    }
}
