//! Dispatch loop and download workers.
//!
//! A single long-lived task pops the head of the queue, hands it to a
//! worker and spaces out dispatches. Workers resolve the stream URL, run
//! the segmented downloader against a `.tmp` sibling and commit with an
//! atomic rename plus the DOWNLOADING -> COMPLETED transition. A worker
//! whose row was moved under it (by the watchdog or recovery) abandons its
//! result; the rename-plus-transition is the only commit that counts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::downloader::FetchError;
use crate::fingerprint::sanitize_filename;
use crate::store::{Track, TrackStatus};

use super::manager::{remove_download_artifacts, BatchManager};
use super::{CAPACITY_POLL, COOLDOWN_POLL, IDLE_POLL, MAX_RETRIES, PREFETCH_LOOKAHEAD, REQUEST_SPACING};

/// The queue dispatch loop.
pub struct Dispatcher {
    manager: Arc<BatchManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<BatchManager>) -> Self {
        Self { manager }
    }

    /// Run until the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Dispatcher starting");
        loop {
            let pause = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// One scheduling decision; returns how long to pause before the next.
    async fn tick(&self) -> Duration {
        let manager = &self.manager;
        let governor = manager.governor();

        if governor.in_cooldown() {
            return COOLDOWN_POLL;
        }
        if !governor.has_capacity() || governor.is_recovering() {
            return CAPACITY_POLL;
        }

        let queued = match manager.store().get_queued_tracks() {
            Ok(queued) => queued,
            Err(e) => {
                error!("Failed to read queue: {:#}", e);
                return IDLE_POLL;
            }
        };
        let Some(head) = queued.first() else {
            return IDLE_POLL;
        };

        match manager
            .transition(&head.id, TrackStatus::Dispatching, |_| {})
            .await
        {
            Ok(Some(track)) => {
                governor.worker_started();
                let worker_manager = manager.clone();
                tokio::spawn(async move {
                    run_worker(worker_manager, track).await;
                });

                // Warm the resolver for whatever is coming next.
                for upcoming in queued.iter().skip(1).take(PREFETCH_LOOKAHEAD) {
                    if let Some(video_id) = &upcoming.source_video_id {
                        manager.resolver().prefetch(video_id);
                    }
                }
                REQUEST_SPACING
            }
            Ok(None) => CAPACITY_POLL,
            Err(e) => {
                error!("Dispatch transition failed: {:#}", e);
                IDLE_POLL
            }
        }
    }
}

enum WorkerError {
    RateLimited(String),
    /// Unrecoverable I/O (rename failure, disk full): no retry.
    Fatal(String),
    Other(String),
}

impl WorkerError {
    fn message(&self) -> &str {
        match self {
            WorkerError::RateLimited(msg)
            | WorkerError::Fatal(msg)
            | WorkerError::Other(msg) => msg,
        }
    }
}

impl From<FetchError> for WorkerError {
    fn from(e: FetchError) -> Self {
        if e.is_rate_limited() {
            WorkerError::RateLimited(e.to_string())
        } else {
            WorkerError::Other(e.to_string())
        }
    }
}

/// Worker entry point. Counter and watchdog bookkeeping happen here so
/// every exit path cleans up.
pub(crate) async fn run_worker(manager: Arc<BatchManager>, track: Track) {
    let track_id = track.id.clone();
    if let Err(error) = download_track(&manager, track).await {
        handle_failure(&manager, &track_id, error).await;
    }
    manager.governor().worker_finished();
    manager.watchdog_entries.lock().unwrap().remove(&track_id);
}

async fn download_track(manager: &Arc<BatchManager>, track: Track) -> Result<(), WorkerError> {
    let Some(track) = manager
        .transition(&track.id, TrackStatus::Downloading, |_| {})
        .await
        .map_err(|e| WorkerError::Other(e.to_string()))?
    else {
        debug!("Track {} no longer dispatching, abandoning", track.id);
        return Ok(());
    };

    let video_id = track
        .source_video_id
        .clone()
        .ok_or_else(|| WorkerError::Other("no source video id".to_string()))?;

    let url = manager
        .resolver()
        .resolve(&video_id)
        .await
        .map_err(|e| WorkerError::Other(e.to_string()))?;

    let dest = destination_path(manager, &track, &url);
    let dest_str = dest.to_string_lossy().to_string();
    let tmp = PathBuf::from(format!("{}.tmp", dest_str));

    // Record the destination while we still own the row.
    if manager
        .update_if_status(&track.id, TrackStatus::Downloading, |t| {
            t.output_file_path = Some(dest_str.clone());
        })
        .await
        .map_err(|e| WorkerError::Other(e.to_string()))?
        .is_none()
    {
        debug!("Track {} was taken away before download start", track.id);
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| WorkerError::Fatal(e.to_string()))?;
    }

    // Seed the watchdog entry so a download that never produces a byte
    // still gets swept.
    manager
        .watchdog_entries
        .lock()
        .unwrap()
        .insert(track.id.clone(), Instant::now());

    let progress_manager = manager.clone();
    let progress_track_id = track.id.clone();
    let bytes = manager
        .downloader
        .download(
            &url,
            &tmp,
            Box::new(move |progress| {
                if let Err(e) = progress_manager.store().update_track_progress(
                    &progress_track_id,
                    progress.downloaded_bytes as i64,
                    progress.total_bytes as i64,
                ) {
                    warn!("Failed to persist progress: {:#}", e);
                }
                progress_manager
                    .watchdog_entries
                    .lock()
                    .unwrap()
                    .insert(progress_track_id.clone(), Instant::now());
            }),
        )
        .await;

    let bytes = match bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            if matches!(e, FetchError::Expired) {
                // The cached URL went stale; force a fresh resolution for
                // the next attempt.
                manager.resolver().invalidate(&video_id);
            }
            return Err(e.into());
        }
    };

    // Commit: atomic rename, then the COMPLETED transition. If the row is
    // no longer ours the file is removed again and the result abandoned.
    tokio::fs::rename(&tmp, &dest)
        .await
        .map_err(|e| WorkerError::Fatal(format!("rename failed: {}", e)))?;

    let committed = manager
        .transition(&track.id, TrackStatus::Completed, |t| {
            t.bytes_downloaded = bytes as i64;
            t.total_bytes = bytes as i64;
            t.output_file_path = Some(dest_str.clone());
            t.error_code = None;
        })
        .await
        .map_err(|e| WorkerError::Other(e.to_string()))?;

    match committed {
        Some(_) => {
            manager.governor().on_success();
            info!("Track {} completed ({} bytes)", track.id, bytes);
            Ok(())
        }
        None => {
            warn!("Track {} was requeued during download, dropping result", track.id);
            let _ = tokio::fs::remove_file(&dest).await;
            Ok(())
        }
    }
}

/// Apply the worker failure policy: rate limits feed the governor, the
/// retry budget decides between requeue and FAILED.
async fn handle_failure(manager: &Arc<BatchManager>, track_id: &str, error: WorkerError) {
    if let WorkerError::RateLimited(msg) = &error {
        let cooldown = manager.governor().on_rate_limit();
        warn!(
            "Rate limited ({}); concurrency now {}, cooling down {}s",
            msg,
            manager.governor().current_max(),
            cooldown.as_secs()
        );
    }

    let error_code = error.message().to_string();
    let result = async {
        let track = manager.store().get_track(track_id)?;
        let Some(track) = track else { return Ok(()) };
        if track.status != TrackStatus::Downloading {
            // The watchdog or recovery already took this row; its files
            // belong to the next attempt now.
            debug!("Track {} no longer ours, skipping failure handling", track_id);
            return Ok(());
        }
        if let Some(path) = &track.output_file_path {
            remove_download_artifacts(path).await;
        }

        let retries = track.retry_count + 1;
        if !matches!(error, WorkerError::Fatal(_)) && retries < MAX_RETRIES {
            manager
                .transition(track_id, TrackStatus::Queued, |t| {
                    t.retry_count = retries;
                    t.bytes_downloaded = 0;
                    t.total_bytes = 0;
                    t.error_code = Some(error_code.clone());
                })
                .await?;
            info!("Track {} requeued (attempt {})", track_id, retries);
        } else {
            manager
                .transition(track_id, TrackStatus::Failed, |t| {
                    t.retry_count = retries;
                    t.error_code = Some(error_code.clone());
                })
                .await?;
            warn!("Track {} failed permanently: {}", track_id, error_code);
        }
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = result {
        error!("Failure handling for track {} errored: {:#}", track_id, e);
    }
}

/// `sanitize(title).{ext}` in the music directory, ext guessed from the
/// stream URL's mime hints.
fn destination_path(manager: &BatchManager, track: &Track, url: &str) -> PathBuf {
    let stem = sanitize_filename(&track.title);
    let stem = if stem.is_empty() {
        track.id.clone()
    } else {
        stem
    };
    manager
        .music_dir()
        .join(format!("{}.{}", stem, extension_for_url(url)))
}

fn extension_for_url(url: &str) -> &'static str {
    let lower = url.to_lowercase();
    if lower.contains("opus") || lower.contains("webm") {
        "opus"
    } else if lower.contains("ogg") || lower.contains("vorbis") {
        "ogg"
    } else {
        "mp3"
    }
}
