//! Resumable single-stream downloader.
//!
//! Maintains a partial `.tmp` next to the destination and picks up where it
//! left off with `Range: bytes=N-` requests. Survives network loss with
//! exponential backoff and stream-URL expiry by asking the resolver for a
//! fresh URL. Used for on-demand single-song downloads where resumability
//! matters more than parallel throughput.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::{FetchError, BUFFER_SIZE};
use crate::resolver::StreamResolver;

/// Attempts before the download is abandoned.
pub const RESUME_MAX_RETRIES: u32 = 15;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Backoff before attempt `retry` (1-based): 2, 4, 8, 16, then capped at
/// 30 seconds.
pub fn retry_delay(retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(4);
    let delay = INITIAL_RETRY_DELAY * 2u32.pow(exponent);
    delay.min(MAX_RETRY_DELAY)
}

/// Events emitted while a resumable download runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeEvent {
    /// Percent within [5, 99].
    Progress(u8),
    /// A retryable failure happened; the next attempt starts after `retry_in`.
    Paused { retry_in: Duration },
}

/// Map downloaded/total onto the [5, 99] progress band; 100 is reserved
/// for the post-rename completion signal.
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let pct = 5 + downloaded.saturating_mul(94) / total;
            pct.min(99) as u8
        }
        _ => 5,
    }
}

pub struct ResumingDownloader {
    client: reqwest::Client,
}

impl ResumingDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download `video_id`'s stream into `dest`, resuming a partial `.tmp`
    /// if one exists. Renames to `dest` on success and returns the final
    /// size in bytes.
    pub async fn download<F>(
        &self,
        resolver: &StreamResolver,
        video_id: &str,
        dest: &Path,
        events: F,
    ) -> Result<u64, FetchError>
    where
        F: Fn(ResumeEvent) + Send + Sync,
    {
        let tmp = tmp_path(dest);
        let mut url = resolver
            .resolve(video_id)
            .await
            .map_err(|_| FetchError::Expired)?;
        let mut retry: u32 = 0;
        // 416 refreshes do not consume the retry budget but are bounded on
        // their own so a permanently broken stream cannot loop forever.
        let mut refreshes: u32 = 0;

        loop {
            match self.attempt(&url, &tmp, &events).await {
                Ok(total) => {
                    tokio::fs::rename(&tmp, dest).await?;
                    return Ok(total);
                }
                Err(FetchError::Expired) => {
                    refreshes += 1;
                    if refreshes > RESUME_MAX_RETRIES {
                        return Err(FetchError::Expired);
                    }
                    debug!("Stream URL for {} expired, refreshing", video_id);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    resolver.invalidate(video_id);
                    url = resolver
                        .resolve(video_id)
                        .await
                        .map_err(|_| FetchError::Expired)?;
                }
                Err(e @ FetchError::RateLimited(_)) | Err(e @ FetchError::Status(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    retry += 1;
                    if retry >= RESUME_MAX_RETRIES {
                        return Err(e);
                    }
                    let delay = retry_delay(retry);
                    warn!(
                        "Download of {} interrupted ({}), retrying in {}s",
                        video_id,
                        e,
                        delay.as_secs()
                    );
                    events(ResumeEvent::Paused { retry_in: delay });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One attempt: issue a (possibly ranged) GET and stream the body onto
    /// the partial file. Returns the total size when the body completes.
    async fn attempt<F>(&self, url: &str, tmp: &Path, events: &F) -> Result<u64, FetchError>
    where
        F: Fn(ResumeEvent) + Send + Sync,
    {
        let mut offset = match tokio::fs::metadata(tmp).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;

        let append = match response.status() {
            reqwest::StatusCode::PARTIAL_CONTENT => true,
            reqwest::StatusCode::OK => {
                // Server ignored the range: restart from scratch.
                offset = 0;
                false
            }
            status => return Err(FetchError::from_status(status)),
        };

        let remaining = response.content_length();
        let total = remaining.map(|r| offset + r);

        let file = if append {
            OpenOptions::new().create(true).append(true).open(tmp).await?
        } else {
            tokio::fs::File::create(tmp).await?
        };
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let mut downloaded = offset;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            events(ResumeEvent::Progress(progress_percent(downloaded, total)));
        }
        writer.flush().await?;

        Ok(downloaded)
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", dest.display()))
}
