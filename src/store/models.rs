//! Data models for batches and tracks.
//!
//! Defines the persisted entities, their status enums and the track state
//! machine transition table.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an import batch.
///
/// Derived from the multiset of its tracks' statuses, except for the
/// initial EXTRACTING and MATCHING phases which the orchestrator sets
/// directly during submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Extracting,
    Matching,
    Downloading,
    AwaitingUser,
    Queued,
    Completed, // terminal
    Failed,    // terminal
}

impl BatchState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            BatchState::Extracting => "EXTRACTING",
            BatchState::Matching => "MATCHING",
            BatchState::Downloading => "DOWNLOADING",
            BatchState::AwaitingUser => "AWAITING_USER",
            BatchState::Queued => "QUEUED",
            BatchState::Completed => "COMPLETED",
            BatchState::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "EXTRACTING" => BatchState::Extracting,
            "MATCHING" => BatchState::Matching,
            "DOWNLOADING" => BatchState::Downloading,
            "AWAITING_USER" => BatchState::AwaitingUser,
            "COMPLETED" => BatchState::Completed,
            "FAILED" => BatchState::Failed,
            _ => BatchState::Queued,
        }
    }
}

/// Status of a single track within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackStatus {
    Extracted,
    Matching,
    Matched,
    MatchedLowConfidence,
    MatchingManual,
    Queued,
    Dispatching,
    Downloading,
    Completed, // terminal
    Failed,
}

impl TrackStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TrackStatus::Extracted => "EXTRACTED",
            TrackStatus::Matching => "MATCHING",
            TrackStatus::Matched => "MATCHED",
            TrackStatus::MatchedLowConfidence => "MATCHED_LOW_CONFIDENCE",
            TrackStatus::MatchingManual => "MATCHING_MANUAL",
            TrackStatus::Queued => "QUEUED",
            TrackStatus::Dispatching => "DISPATCHING",
            TrackStatus::Downloading => "DOWNLOADING",
            TrackStatus::Completed => "COMPLETED",
            TrackStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "MATCHING" => TrackStatus::Matching,
            "MATCHED" => TrackStatus::Matched,
            "MATCHED_LOW_CONFIDENCE" => TrackStatus::MatchedLowConfidence,
            "MATCHING_MANUAL" => TrackStatus::MatchingManual,
            "QUEUED" => TrackStatus::Queued,
            "DISPATCHING" => TrackStatus::Dispatching,
            "DOWNLOADING" => TrackStatus::Downloading,
            "COMPLETED" => TrackStatus::Completed,
            "FAILED" => TrackStatus::Failed,
            _ => TrackStatus::Extracted,
        }
    }

    /// Returns true if a worker is (or should be) actively holding this track.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TrackStatus::Dispatching | TrackStatus::Downloading)
    }

    /// Returns true if the track still has work ahead of it.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TrackStatus::Matching
                | TrackStatus::Queued
                | TrackStatus::Dispatching
                | TrackStatus::Downloading
        )
    }
}

/// Returns true if the track state machine permits `from -> to`.
///
/// Anything not listed here is forbidden; callers treat a forbidden
/// transition as a silent no-op and must not touch the store.
pub fn transition_permitted(from: TrackStatus, to: TrackStatus) -> bool {
    use TrackStatus::*;
    match from {
        Extracted => matches!(to, Matching | Matched | Queued),
        Matching => matches!(to, Matched | MatchedLowConfidence | Failed),
        Matched => matches!(to, Queued),
        MatchedLowConfidence => matches!(to, Matched | Matching | MatchingManual),
        MatchingManual => matches!(to, Matched | MatchedLowConfidence | Failed),
        Queued => matches!(to, Dispatching),
        Dispatching => matches!(to, Downloading | Queued),
        Downloading => matches!(to, Completed | Failed | Queued),
        Failed => matches!(to, Queued),
        Completed => false,
    }
}

/// A submitted playlist/album import unit.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    pub state: BatchState,
    pub total_tracks: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub error_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Batch {
    /// Create a new batch in the EXTRACTING state.
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: BatchState::Extracting,
            total_tracks: 0,
            completed_count: 0,
            failed_count: 0,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single song within a batch with its own lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: String,
    pub batch_id: String,
    /// SHA-256 hex over the normalized (title, artist, duration bucket).
    pub fingerprint: String,
    pub title: String,
    pub artist: String,
    pub duration_seconds: Option<i64>,
    pub thumbnail_url: Option<String>,
    pub source_platform: String,
    /// Resolvable id on the video platform; set on MATCHED or carried
    /// through from extraction for the fast path.
    pub source_video_id: Option<String>,
    pub match_confidence: Option<f64>,
    pub status: TrackStatus,
    pub retry_count: i64,
    pub bytes_downloaded: i64,
    pub total_bytes: i64,
    pub output_file_path: Option<String>,
    pub error_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Track {
    pub fn new(batch_id: String, fingerprint: String, title: String, artist: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id,
            fingerprint,
            title,
            artist,
            duration_seconds: None,
            thumbnail_url: None,
            source_platform: String::new(),
            source_video_id: None,
            match_confidence: None,
            status: TrackStatus::Extracted,
            retry_count: 0,
            bytes_downloaded: 0,
            total_bytes: 0,
            output_file_path: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_duration(mut self, duration_seconds: Option<i64>) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn with_thumbnail(mut self, thumbnail_url: Option<String>) -> Self {
        self.thumbnail_url = thumbnail_url;
        self
    }

    pub fn with_platform(mut self, source_platform: String) -> Self {
        self.source_platform = source_platform;
        self
    }

    pub fn with_source_video_id(mut self, source_video_id: Option<String>) -> Self {
        self.source_video_id = source_video_id;
        self
    }
}

/// Per-status track counts for one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStatusCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub low_confidence: i64,
    /// Tracks in MATCHING, QUEUED, DISPATCHING or DOWNLOADING.
    pub active: i64,
}

/// Derive the batch state from its tracks' status counts.
///
/// This is a pure function; the orchestrator recomputes it after every
/// track mutation.
pub fn derive_batch_state(counts: &BatchStatusCounts) -> BatchState {
    if counts.completed + counts.failed == counts.total && counts.low_confidence == 0 {
        if counts.failed == counts.total && counts.total > 0 {
            return BatchState::Failed;
        }
        return BatchState::Completed;
    }
    if counts.failed == counts.total && counts.total > 0 {
        return BatchState::Failed;
    }
    if counts.low_confidence > 0 && counts.active == 0 {
        return BatchState::AwaitingUser;
    }
    if counts.active > 0 {
        return BatchState::Downloading;
    }
    BatchState::Queued
}

/// Result of submitting an import, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub batch_id: String,
    pub track_count: usize,
    pub duplicates_skipped: usize,
}
