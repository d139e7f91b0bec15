//! File downloaders.
//!
//! [`segmented`] fetches a stream URL into a destination file, splitting
//! into parallel byte ranges when the server supports them. [`resume`] is
//! the single-song path: one stream, resumable at byte granularity across
//! network loss and URL expiry.

pub mod resume;
pub mod segmented;

pub use resume::{ResumeEvent, ResumingDownloader};
pub use segmented::SegmentedDownloader;

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the downloaders. Callers match on `RateLimited` to
/// drive the global cooldown; everything else is a per-track failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by host (status {0})")]
    RateLimited(u16),
    #[error("stream URL expired")]
    Expired,
    #[error("download failed with status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited(_))
    }

    /// Map an HTTP status to the right error variant.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            429 | 403 => FetchError::RateLimited(status.as_u16()),
            416 => FetchError::Expired,
            code => FetchError::Status(code),
        }
    }
}

/// A throttled progress report.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Average over the whole download so far.
    pub bytes_per_sec: u64,
}

/// Progress callback; reports arrive at most every
/// [`segmented::PROGRESS_INTERVAL`].
pub type ProgressFn = Box<dyn Fn(Progress) + Send + Sync>;

/// Read/write buffer size for download streams.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Minimum spacing between progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_rate_limit_statuses() {
        assert!(FetchError::from_status(StatusCode::TOO_MANY_REQUESTS).is_rate_limited());
        assert!(FetchError::from_status(StatusCode::FORBIDDEN).is_rate_limited());
        assert!(!FetchError::from_status(StatusCode::NOT_FOUND).is_rate_limited());
        assert!(!FetchError::from_status(StatusCode::INTERNAL_SERVER_ERROR).is_rate_limited());
    }

    #[test]
    fn test_expired_status() {
        assert!(matches!(
            FetchError::from_status(StatusCode::RANGE_NOT_SATISFIABLE),
            FetchError::Expired
        ));
    }
}
