//! Segmented parallel downloader.
//!
//! Probes the server with HEAD; when byte ranges are supported and the file
//! is big enough, fetches N contiguous ranges concurrently into `.seg{i}`
//! temp files and concatenates them in index order. Otherwise streams the
//! body in one GET.

use futures::future::try_join_all;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{FetchError, Progress, ProgressFn, BUFFER_SIZE, PROGRESS_INTERVAL};

/// Number of parallel byte ranges.
pub const SEGMENT_COUNT: u64 = 4;

/// Ranged mode requires at least this many bytes per segment.
pub const MIN_SEGMENT_SIZE: u64 = 256 * 1024;

/// Shared progress accounting across segments.
struct ProgressState {
    total: u64,
    downloaded: u64,
    started: Instant,
    last_emit: Instant,
}

struct ProgressTracker {
    state: Mutex<ProgressState>,
    callback: ProgressFn,
}

impl ProgressTracker {
    fn new(total: u64, callback: ProgressFn) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(ProgressState {
                total,
                downloaded: 0,
                started: now,
                last_emit: now - PROGRESS_INTERVAL,
            }),
            callback,
        }
    }

    /// Add downloaded bytes; emits at most every [`PROGRESS_INTERVAL`].
    fn add(&self, bytes: u64) {
        let report = {
            let mut state = self.state.lock().unwrap();
            state.downloaded += bytes;
            if state.last_emit.elapsed() < PROGRESS_INTERVAL {
                None
            } else {
                state.last_emit = Instant::now();
                let elapsed = state.started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    (state.downloaded as f64 / elapsed) as u64
                } else {
                    0
                };
                Some(Progress {
                    total_bytes: state.total,
                    downloaded_bytes: state.downloaded,
                    bytes_per_sec: rate,
                })
            }
        };
        if let Some(progress) = report {
            (self.callback)(progress);
        }
    }

    fn downloaded(&self) -> u64 {
        self.state.lock().unwrap().downloaded
    }
}

/// What the HEAD probe learned about the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
}

/// Split `len` bytes into [`SEGMENT_COUNT`] contiguous inclusive ranges,
/// the last absorbing the remainder. Returns None when the file is too
/// small to be worth splitting.
pub fn plan_segments(probe: &Probe) -> Option<Vec<(u64, u64)>> {
    if !probe.accepts_ranges {
        return None;
    }
    let len = probe.content_length?;
    if len <= MIN_SEGMENT_SIZE * SEGMENT_COUNT {
        return None;
    }
    let base = len / SEGMENT_COUNT;
    let mut ranges = Vec::with_capacity(SEGMENT_COUNT as usize);
    for i in 0..SEGMENT_COUNT {
        let start = i * base;
        let end = if i == SEGMENT_COUNT - 1 {
            len - 1
        } else {
            (i + 1) * base - 1
        };
        ranges.push((start, end));
    }
    Some(ranges)
}

pub struct SegmentedDownloader {
    client: reqwest::Client,
}

impl SegmentedDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download `url` into `dest`, reporting throttled progress. Returns
    /// the number of bytes written.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn,
    ) -> Result<u64, FetchError> {
        let probe = self.probe(url).await;

        match plan_segments(&probe) {
            Some(ranges) => {
                let total = probe.content_length.unwrap_or(0);
                let tracker = Arc::new(ProgressTracker::new(total, progress));
                match self.download_ranged(url, dest, &ranges, tracker.clone()).await {
                    Ok(()) => Ok(tracker.downloaded()),
                    Err(e) => {
                        remove_segment_files(dest, ranges.len()).await;
                        Err(e)
                    }
                }
            }
            None => {
                let total = probe.content_length.unwrap_or(0);
                let tracker = ProgressTracker::new(total, progress);
                self.download_single(url, dest, &tracker).await?;
                Ok(tracker.downloaded())
            }
        }
    }

    /// HEAD probe; failures degrade to single-stream mode rather than
    /// erroring, the GET will surface anything real.
    async fn probe(&self, url: &str) -> Probe {
        let response = match self.client.head(url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => {
                return Probe {
                    content_length: None,
                    accepts_ranges: false,
                }
            }
        };

        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.eq_ignore_ascii_case("none"))
            .unwrap_or(false);

        Probe {
            content_length,
            accepts_ranges,
        }
    }

    async fn download_ranged(
        &self,
        url: &str,
        dest: &Path,
        ranges: &[(u64, u64)],
        tracker: Arc<ProgressTracker>,
    ) -> Result<(), FetchError> {
        debug!("Ranged download of {} in {} segments", url, ranges.len());

        let fetches = ranges.iter().enumerate().map(|(i, (start, end))| {
            let seg_path = segment_path(dest, i);
            let tracker = tracker.clone();
            let client = self.client.clone();
            let url = url.to_string();
            let (start, end) = (*start, *end);
            async move {
                let response = client
                    .get(&url)
                    .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end))
                    .send()
                    .await?;
                if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
                    return Err(FetchError::from_status(response.status()));
                }
                write_body(response, &seg_path, &tracker).await
            }
        });
        try_join_all(fetches).await?;

        // Concatenate in index order, not completion order.
        let mut out = BufWriter::with_capacity(BUFFER_SIZE, File::create(dest).await?);
        for i in 0..ranges.len() {
            let seg_path = segment_path(dest, i);
            let mut seg = File::open(&seg_path).await?;
            tokio::io::copy(&mut seg, &mut out).await?;
        }
        out.flush().await?;
        remove_segment_files(dest, ranges.len()).await;
        Ok(())
    }

    async fn download_single(
        &self,
        url: &str,
        dest: &Path,
        tracker: &ProgressTracker,
    ) -> Result<(), FetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::from_status(response.status()));
        }
        write_body(response, dest, tracker).await
    }
}

/// Stream a response body into a file.
async fn write_body(
    response: reqwest::Response,
    path: &Path,
    tracker: &ProgressTracker,
) -> Result<(), FetchError> {
    let file = File::create(path).await?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        tracker.add(chunk.len() as u64);
    }
    writer.flush().await?;
    Ok(())
}

pub(super) fn segment_path(dest: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.seg{}", dest.display(), index))
}

pub(super) async fn remove_segment_files(dest: &Path, count: usize) {
    for i in 0..count {
        let _ = tokio::fs::remove_file(segment_path(dest, i)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(len: Option<u64>, ranges: bool) -> Probe {
        Probe {
            content_length: len,
            accepts_ranges: ranges,
        }
    }

    #[test]
    fn test_no_ranges_forces_single_stream() {
        // Even a huge file stays single-stream without Accept-Ranges.
        assert!(plan_segments(&probe(Some(1 << 30), false)).is_none());
    }

    #[test]
    fn test_small_file_stays_single_stream() {
        assert!(plan_segments(&probe(Some(MIN_SEGMENT_SIZE * SEGMENT_COUNT), true)).is_none());
        assert!(plan_segments(&probe(None, true)).is_none());
    }

    #[test]
    fn test_segment_split_covers_everything() {
        let len = MIN_SEGMENT_SIZE * SEGMENT_COUNT + 13;
        let ranges = plan_segments(&probe(Some(len), true)).unwrap();
        assert_eq!(ranges.len(), SEGMENT_COUNT as usize);
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, len - 1);
        // Contiguous, no gaps or overlaps.
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        // The remainder lands in the last range.
        let covered: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(covered, len);
    }

    #[test]
    fn test_segment_split_equal_when_divisible() {
        let len = 4 * 1024 * 1024;
        let ranges = plan_segments(&probe(Some(len), true)).unwrap();
        let sizes: Vec<u64> = ranges.iter().map(|(s, e)| e - s + 1).collect();
        assert!(sizes.iter().all(|s| *s == len / SEGMENT_COUNT));
    }

    #[test]
    fn test_segment_path_naming() {
        let dest = Path::new("/music/song.opus.tmp");
        assert_eq!(
            segment_path(dest, 2),
            PathBuf::from("/music/song.opus.tmp.seg2")
        );
    }

    #[test]
    fn test_progress_throttling() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();
        let tracker = ProgressTracker::new(
            1000,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // The first add after construction emits; rapid follow-ups do not.
        tracker.add(10);
        tracker.add(10);
        tracker.add(10);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.downloaded(), 30);
    }
}
