//! Batch manager: submission, matching, transitions and recovery.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::downloader::SegmentedDownloader;
use crate::extractor::{Extractor, SourcePlatform, MAX_CANDIDATES};
use crate::fingerprint::fingerprint;
use crate::mapper::{TrackMapper, CONFIDENCE_THRESHOLD};
use crate::resolver::StreamResolver;
use crate::store::{
    derive_batch_state, transition_permitted, Batch, BatchState, ImportResult, ImportStore, Track,
    TrackStatus,
};

use super::governor::ConcurrencyGovernor;
use super::MATCH_CONCURRENCY;

/// The orchestration engine. Shared as an `Arc` between the HTTP facade
/// and the background tasks.
pub struct BatchManager {
    pub(crate) store: Arc<dyn ImportStore>,
    pub(crate) extractor: Extractor,
    pub(crate) mapper: TrackMapper,
    pub(crate) resolver: StreamResolver,
    pub(crate) downloader: SegmentedDownloader,
    pub(crate) governor: ConcurrencyGovernor,
    /// Serializes every state-machine decision.
    pub(crate) transition_lock: tokio::sync::Mutex<()>,
    /// track_id -> last progress timestamp, maintained by workers and
    /// swept by the watchdog.
    pub(crate) watchdog_entries: Mutex<HashMap<String, Instant>>,
    /// Final audio files land here.
    pub(crate) music_dir: PathBuf,
}

impl BatchManager {
    pub fn new(
        store: Arc<dyn ImportStore>,
        extractor: Extractor,
        mapper: TrackMapper,
        resolver: StreamResolver,
        downloader: SegmentedDownloader,
        music_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            extractor,
            mapper,
            resolver,
            downloader,
            governor: ConcurrencyGovernor::new(),
            transition_lock: tokio::sync::Mutex::new(()),
            watchdog_entries: Mutex::new(HashMap::new()),
            music_dir,
        }
    }

    pub fn store(&self) -> &Arc<dyn ImportStore> {
        &self.store
    }

    pub fn resolver(&self) -> &StreamResolver {
        &self.resolver
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn music_dir(&self) -> &PathBuf {
        &self.music_dir
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Create a batch for `url`, extract its tracks and kick off the
    /// matching phase. Returns once the tracks are persisted.
    pub async fn submit_batch(self: &Arc<Self>, url: &str) -> Result<ImportResult> {
        let platform = SourcePlatform::detect(url);
        let mut batch = Batch::new();
        self.store.insert_batch(&batch)?;
        info!("Batch {} submitted for {} ({:?})", batch.id, url, platform);

        let candidates = self.extractor.extract(url, platform).await;

        if candidates.is_empty() {
            batch.state = BatchState::Failed;
            batch.error_code = Some("could not extract".to_string());
            self.store.update_batch(&batch)?;
            return Err(anyhow!("could not extract any tracks from {}", url));
        }
        if candidates.len() > MAX_CANDIDATES {
            batch.state = BatchState::Failed;
            batch.error_code = Some("too large".to_string());
            self.store.update_batch(&batch)?;
            return Err(anyhow!("playlist too large ({} tracks)", candidates.len()));
        }

        let candidate_count = candidates.len();
        let tracks: Vec<Track> = candidates
            .into_iter()
            .map(|c| {
                let fp = fingerprint(&c.title, &c.artist, c.duration_seconds);
                Track::new(batch.id.clone(), fp, c.title, c.artist)
                    .with_duration(c.duration_seconds)
                    .with_thumbnail(c.thumbnail_url)
                    .with_platform(platform.as_str().to_string())
                    .with_source_video_id(c.source_video_id)
            })
            .collect();

        let inserted = self.store.insert_tracks_bulk(&tracks)?;
        batch.total_tracks = inserted as i64;
        batch.state = BatchState::Matching;
        self.store.update_batch(&batch)?;

        info!(
            "Batch {}: {} tracks inserted ({} duplicates skipped), matching",
            batch.id,
            inserted,
            candidate_count - inserted
        );

        let manager = self.clone();
        let batch_id = batch.id.clone();
        tokio::spawn(async move {
            manager.run_matching(&batch_id).await;
        });

        Ok(ImportResult {
            batch_id: batch.id,
            track_count: inserted,
            duplicates_skipped: candidate_count - inserted,
        })
    }

    // =========================================================================
    // Matching phase
    // =========================================================================

    /// Match every extracted track of a batch, a few at a time.
    pub(crate) async fn run_matching(self: &Arc<Self>, batch_id: &str) {
        let tracks = match self.store.get_tracks_for_batch(batch_id) {
            Ok(tracks) => tracks,
            Err(e) => {
                error!("Failed to load tracks for batch {}: {:#}", batch_id, e);
                return;
            }
        };

        futures::stream::iter(
            tracks
                .into_iter()
                .filter(|t| t.status == TrackStatus::Extracted),
        )
        .for_each_concurrent(MATCH_CONCURRENCY, |track| {
            let manager = self.clone();
            async move {
                if let Err(e) = manager.match_one(track).await {
                    warn!("Matching error: {:#}", e);
                }
            }
        })
        .await;

        debug!("Matching phase finished for batch {}", batch_id);
    }

    /// Match a single extracted track: fast path straight to QUEUED when a
    /// video id is already known, slow path through the mapper.
    async fn match_one(self: &Arc<Self>, track: Track) -> Result<()> {
        if let Some(video_id) = track.source_video_id.clone() {
            let queued = self
                .transition(&track.id, TrackStatus::Queued, |t| {
                    t.match_confidence = Some(1.0);
                })
                .await?;
            if queued.is_some() {
                self.resolver.prefetch(&video_id);
            }
            return Ok(());
        }

        if self
            .transition(&track.id, TrackStatus::Matching, |_| {})
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.resolve_match(&track).await
    }

    /// Run the mapper for a track already in MATCHING and apply the
    /// outcome. Also used by the rematch action.
    pub(crate) async fn resolve_match(self: &Arc<Self>, track: &Track) -> Result<()> {
        match self.mapper.map(&track.title, &track.artist).await {
            Ok(Some(outcome)) => {
                let video_id = outcome.video_id.clone();
                if outcome.confidence >= CONFIDENCE_THRESHOLD {
                    self.transition(&track.id, TrackStatus::Matched, |t| {
                        t.source_video_id = Some(outcome.video_id.clone());
                        t.match_confidence = Some(outcome.confidence);
                        t.error_code = None;
                    })
                    .await?;
                    let queued = self
                        .transition(&track.id, TrackStatus::Queued, |_| {})
                        .await?;
                    if queued.is_some() {
                        self.resolver.prefetch(&video_id);
                    }
                } else {
                    self.transition(&track.id, TrackStatus::MatchedLowConfidence, |t| {
                        t.source_video_id = Some(outcome.video_id.clone());
                        t.match_confidence = Some(outcome.confidence);
                    })
                    .await?;
                }
            }
            Ok(None) => {
                self.transition(&track.id, TrackStatus::Failed, |t| {
                    t.error_code = Some("no match found".to_string());
                })
                .await?;
            }
            Err(e) => {
                warn!("Mapper failed for track {}: {:#}", track.id, e);
                self.transition(&track.id, TrackStatus::Failed, |t| {
                    t.error_code = Some("match lookup failed".to_string());
                })
                .await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Attempt a state transition under the orchestrator mutex.
    ///
    /// Forbidden transitions are silent no-ops returning `None` without
    /// touching the store. On success the mutated row is persisted, the
    /// owning batch's derived state is refreshed, and the updated track is
    /// returned.
    pub async fn transition<F>(
        &self,
        track_id: &str,
        to: TrackStatus,
        mutate: F,
    ) -> Result<Option<Track>>
    where
        F: FnOnce(&mut Track),
    {
        let _guard = self.transition_lock.lock().await;

        let mut track = match self.store.get_track(track_id)? {
            Some(track) => track,
            None => return Ok(None),
        };
        let from = track.status;
        if !transition_permitted(from, to) {
            debug!(
                "Ignoring forbidden transition {:?} -> {:?} for track {}",
                from, to, track_id
            );
            return Ok(None);
        }

        track.status = to;
        mutate(&mut track);
        self.store.update_track(&track)?;
        self.refresh_batch(&track.batch_id)?;

        debug!("Track {} transitioned {:?} -> {:?}", track_id, from, to);
        Ok(Some(track))
    }

    /// Mutate a track's non-status fields, but only while it still sits in
    /// `expected` status. Returns `None` when someone else moved it, which
    /// tells a worker its ownership is gone.
    pub(crate) async fn update_if_status<F>(
        &self,
        track_id: &str,
        expected: TrackStatus,
        mutate: F,
    ) -> Result<Option<Track>>
    where
        F: FnOnce(&mut Track),
    {
        let _guard = self.transition_lock.lock().await;
        let mut track = match self.store.get_track(track_id)? {
            Some(track) => track,
            None => return Ok(None),
        };
        if track.status != expected {
            return Ok(None);
        }
        mutate(&mut track);
        self.store.update_track(&track)?;
        Ok(Some(track))
    }

    /// Recompute the owning batch's derived state and counters from its
    /// track multiset. Caller holds the transition lock.
    fn refresh_batch(&self, batch_id: &str) -> Result<()> {
        let counts = self.store.batch_status_counts(batch_id)?;
        if counts.total == 0 {
            return Ok(());
        }
        let mut batch = match self.store.get_batch(batch_id)? {
            Some(batch) => batch,
            None => return Ok(()),
        };
        if batch.state == BatchState::Extracting {
            return Ok(());
        }

        let derived = derive_batch_state(&counts);
        batch.completed_count = counts.completed;
        batch.failed_count = counts.failed;
        if derived == BatchState::Failed && batch.error_code.is_none() {
            batch.error_code = Some("all tracks failed".to_string());
        }
        batch.state = derived;
        self.store.update_batch(&batch)?;
        Ok(())
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    /// Requeue anything a dead process left in flight and clean up its
    /// partial files. Runs once at engine start, before dispatch begins.
    pub async fn recover(&self) -> Result<usize> {
        self.governor.set_recovering(true);
        let _guard = self.transition_lock.lock().await;

        let stalled = self.store.get_stalled_tracks()?;
        let mut requeued = 0;

        for mut track in stalled {
            if let Some(path) = &track.output_file_path {
                remove_download_artifacts(path).await;
            }
            let from = track.status;
            if !transition_permitted(from, TrackStatus::Queued) {
                continue;
            }
            track.status = TrackStatus::Queued;
            track.bytes_downloaded = 0;
            track.total_bytes = 0;
            self.store.update_track(&track)?;
            self.refresh_batch(&track.batch_id)?;
            requeued += 1;
            info!("Recovery requeued track {} (was {:?})", track.id, from);
        }

        self.governor.reset_active_workers();
        self.governor.set_recovering(false);
        if requeued > 0 {
            info!("Recovery requeued {} stalled tracks", requeued);
        }
        Ok(requeued)
    }
}

/// Delete a download's final file and its `.tmp` / `.tmp.seg*` siblings.
pub(crate) async fn remove_download_artifacts(final_path: &str) {
    let _ = tokio::fs::remove_file(final_path).await;
    let tmp = format!("{}.tmp", final_path);
    let _ = tokio::fs::remove_file(&tmp).await;
    for i in 0..crate::downloader::segmented::SEGMENT_COUNT {
        let _ = tokio::fs::remove_file(format!("{}.seg{}", tmp, i)).await;
    }
}
