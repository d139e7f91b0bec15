//! Batch/track storage and persistence.
//!
//! SQLite-backed storage for import batches and their tracks. Each mutation
//! is durable before the call returns; reads are row-level consistent.
//! State-machine coherence across read-modify-write sequences is the
//! orchestrator's job, not the store's.

use super::models::{Batch, BatchState, BatchStatusCounts, Track, TrackStatus};
use super::schema::IMPORT_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Storage operations for import batches and tracks.
pub trait ImportStore: Send + Sync {
    // === Batches ===

    fn insert_batch(&self, batch: &Batch) -> Result<()>;

    /// Persist all mutable batch fields; refreshes `updated_at`.
    fn update_batch(&self, batch: &Batch) -> Result<()>;

    fn get_batch(&self, id: &str) -> Result<Option<Batch>>;

    /// All batches, newest first.
    fn list_batches(&self) -> Result<Vec<Batch>>;

    // === Tracks ===

    /// Insert tracks, skipping duplicates on (batch_id, fingerprint).
    /// Returns the number of rows actually inserted.
    fn insert_tracks_bulk(&self, tracks: &[Track]) -> Result<usize>;

    /// Persist all mutable track fields; refreshes `updated_at`.
    fn update_track(&self, track: &Track) -> Result<()>;

    /// Write only the byte counters for an in-flight download. Progress
    /// callbacks race with status transitions, so they must not touch any
    /// other column.
    fn update_track_progress(&self, id: &str, bytes_downloaded: i64, total_bytes: i64)
        -> Result<()>;

    fn get_track(&self, id: &str) -> Result<Option<Track>>;

    fn get_tracks_for_batch(&self, batch_id: &str) -> Result<Vec<Track>>;

    /// QUEUED tracks in FIFO order by `updated_at`.
    fn get_queued_tracks(&self) -> Result<Vec<Track>>;

    /// Tracks in DISPATCHING or DOWNLOADING, i.e. owned by a worker of a
    /// prior process lifetime when called at startup.
    fn get_stalled_tracks(&self) -> Result<Vec<Track>>;

    fn get_batch_with_tracks(&self, id: &str) -> Result<Option<(Batch, Vec<Track>)>>;

    /// Per-status counts for one batch, used to derive the batch state.
    fn batch_status_counts(&self, batch_id: &str) -> Result<BatchStatusCounts>;
}

/// SQLite-backed import store.
pub struct SqliteImportStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteImportStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let exists = db_path.as_ref().exists();
        let conn = Connection::open(&db_path)?;
        open_versioned(&conn, IMPORT_VERSIONED_SCHEMAS, exists)
            .context("Failed to open import database")?;
        if !exists {
            info!("Created new import database at {:?}", db_path.as_ref());
        }
        Ok(SqliteImportStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        open_versioned(&conn, IMPORT_VERSIONED_SCHEMAS, false)?;
        Ok(SqliteImportStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn batch_from_row(row: &Row) -> rusqlite::Result<Batch> {
        Ok(Batch {
            id: row.get("id")?,
            state: BatchState::from_db_str(&row.get::<_, String>("state")?),
            total_tracks: row.get("total_tracks")?,
            completed_count: row.get("completed_count")?,
            failed_count: row.get("failed_count")?,
            error_code: row.get("error_code")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn track_from_row(row: &Row) -> rusqlite::Result<Track> {
        Ok(Track {
            id: row.get("id")?,
            batch_id: row.get("batch_id")?,
            fingerprint: row.get("fingerprint")?,
            title: row.get("title")?,
            artist: row.get("artist")?,
            duration_seconds: row.get("duration_seconds")?,
            thumbnail_url: row.get("thumbnail_url")?,
            source_platform: row.get("source_platform")?,
            source_video_id: row.get("source_video_id")?,
            match_confidence: row.get("match_confidence")?,
            status: TrackStatus::from_db_str(&row.get::<_, String>("status")?),
            retry_count: row.get("retry_count")?,
            bytes_downloaded: row.get("bytes_downloaded")?,
            total_bytes: row.get("total_bytes")?,
            output_file_path: row.get("output_file_path")?,
            error_code: row.get("error_code")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl ImportStore for SqliteImportStore {
    fn insert_batch(&self, batch: &Batch) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO batches (id, state, total_tracks, completed_count, failed_count,
                                  error_code, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                batch.id,
                batch.state.as_db_str(),
                batch.total_tracks,
                batch.completed_count,
                batch.failed_count,
                batch.error_code,
                batch.created_at,
                batch.updated_at,
            ],
        )
        .context("Failed to insert batch")?;
        Ok(())
    }

    fn update_batch(&self, batch: &Batch) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE batches SET state = ?2, total_tracks = ?3, completed_count = ?4,
                                failed_count = ?5, error_code = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                batch.id,
                batch.state.as_db_str(),
                batch.total_tracks,
                batch.completed_count,
                batch.failed_count,
                batch.error_code,
                now,
            ],
        )
        .context("Failed to update batch")?;
        Ok(())
    }

    fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM batches WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], Self::batch_from_row)?;
        Ok(rows.next().transpose()?)
    }

    fn list_batches(&self) -> Result<Vec<Batch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM batches ORDER BY created_at DESC")?;
        let batches = stmt
            .query_map(params![], Self::batch_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    fn insert_tracks_bulk(&self, tracks: &[Track]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO tracks
                   (id, batch_id, fingerprint, title, artist, duration_seconds, thumbnail_url,
                    source_platform, source_video_id, match_confidence, status, retry_count,
                    bytes_downloaded, total_bytes, output_file_path, error_code,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            for track in tracks {
                inserted += stmt.execute(params![
                    track.id,
                    track.batch_id,
                    track.fingerprint,
                    track.title,
                    track.artist,
                    track.duration_seconds,
                    track.thumbnail_url,
                    track.source_platform,
                    track.source_video_id,
                    track.match_confidence,
                    track.status.as_db_str(),
                    track.retry_count,
                    track.bytes_downloaded,
                    track.total_bytes,
                    track.output_file_path,
                    track.error_code,
                    track.created_at,
                    track.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn update_track(&self, track: &Track) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tracks SET title = ?2, artist = ?3, duration_seconds = ?4,
                               thumbnail_url = ?5, source_platform = ?6, source_video_id = ?7,
                               match_confidence = ?8, status = ?9, retry_count = ?10,
                               bytes_downloaded = ?11, total_bytes = ?12,
                               output_file_path = ?13, error_code = ?14, updated_at = ?15
             WHERE id = ?1",
            params![
                track.id,
                track.title,
                track.artist,
                track.duration_seconds,
                track.thumbnail_url,
                track.source_platform,
                track.source_video_id,
                track.match_confidence,
                track.status.as_db_str(),
                track.retry_count,
                track.bytes_downloaded,
                track.total_bytes,
                track.output_file_path,
                track.error_code,
                now,
            ],
        )
        .context("Failed to update track")?;
        Ok(())
    }

    fn update_track_progress(
        &self,
        id: &str,
        bytes_downloaded: i64,
        total_bytes: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tracks SET bytes_downloaded = ?2, total_bytes = ?3 WHERE id = ?1",
            params![id, bytes_downloaded, total_bytes],
        )
        .context("Failed to update track progress")?;
        Ok(())
    }

    fn get_track(&self, id: &str) -> Result<Option<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM tracks WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], Self::track_from_row)?;
        Ok(rows.next().transpose()?)
    }

    fn get_tracks_for_batch(&self, batch_id: &str) -> Result<Vec<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM tracks WHERE batch_id = ?1 ORDER BY created_at ASC")?;
        let tracks = stmt
            .query_map(params![batch_id], Self::track_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    fn get_queued_tracks(&self) -> Result<Vec<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM tracks WHERE status = 'QUEUED' ORDER BY updated_at ASC")?;
        let tracks = stmt
            .query_map(params![], Self::track_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    fn get_stalled_tracks(&self) -> Result<Vec<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM tracks WHERE status IN ('DISPATCHING', 'DOWNLOADING')
             ORDER BY updated_at ASC",
        )?;
        let tracks = stmt
            .query_map(params![], Self::track_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    fn get_batch_with_tracks(&self, id: &str) -> Result<Option<(Batch, Vec<Track>)>> {
        let batch = match self.get_batch(id)? {
            Some(batch) => batch,
            None => return Ok(None),
        };
        let tracks = self.get_tracks_for_batch(id)?;
        Ok(Some((batch, tracks)))
    }

    fn batch_status_counts(&self, batch_id: &str) -> Result<BatchStatusCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM tracks WHERE batch_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![batch_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BatchStatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            let status = TrackStatus::from_db_str(&status);
            counts.total += n;
            match status {
                TrackStatus::Completed => counts.completed += n,
                TrackStatus::Failed => counts.failed += n,
                TrackStatus::MatchedLowConfidence => counts.low_confidence += n,
                s if s.is_active() => counts.active += n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_batch() -> Batch {
        Batch::new()
    }

    fn make_track(batch_id: &str, fingerprint: &str) -> Track {
        Track::new(
            batch_id.to_string(),
            fingerprint.to_string(),
            "Title".to_string(),
            "Artist".to_string(),
        )
        .with_platform("video".to_string())
    }

    #[test]
    fn test_create_new_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("grabbify.db");
        let _store = SqliteImportStore::new(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("grabbify.db");

        let batch = make_batch();
        {
            let store = SqliteImportStore::new(&db_path).unwrap();
            store.insert_batch(&batch).unwrap();
        }

        let store = SqliteImportStore::new(&db_path).unwrap();
        let loaded = store.get_batch(&batch.id).unwrap().unwrap();
        assert_eq!(loaded.state, BatchState::Extracting);
    }

    #[test]
    fn test_batch_round_trip() {
        let store = SqliteImportStore::in_memory().unwrap();
        let mut batch = make_batch();
        store.insert_batch(&batch).unwrap();

        batch.state = BatchState::Matching;
        batch.total_tracks = 12;
        batch.error_code = Some("oops".to_string());
        store.update_batch(&batch).unwrap();

        let loaded = store.get_batch(&batch.id).unwrap().unwrap();
        assert_eq!(loaded.state, BatchState::Matching);
        assert_eq!(loaded.total_tracks, 12);
        assert_eq!(loaded.error_code.as_deref(), Some("oops"));
    }

    #[test]
    fn test_get_missing_batch() {
        let store = SqliteImportStore::in_memory().unwrap();
        assert!(store.get_batch("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_batches_newest_first() {
        let store = SqliteImportStore::in_memory().unwrap();
        let mut first = make_batch();
        first.created_at = 100;
        let mut second = make_batch();
        second.created_at = 200;
        store.insert_batch(&first).unwrap();
        store.insert_batch(&second).unwrap();

        let batches = store.list_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].id, second.id);
    }

    #[test]
    fn test_bulk_insert_dedups_fingerprints() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();

        let tracks = vec![
            make_track(&batch.id, "fp1"),
            make_track(&batch.id, "fp2"),
            make_track(&batch.id, "fp1"),
        ];
        let inserted = store.insert_tracks_bulk(&tracks).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.get_tracks_for_batch(&batch.id).unwrap().len(), 2);
    }

    #[test]
    fn test_track_round_trip() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();

        let mut track = make_track(&batch.id, "fp1");
        store.insert_tracks_bulk(std::slice::from_ref(&track)).unwrap();

        track.status = TrackStatus::Downloading;
        track.source_video_id = Some("v42".to_string());
        track.match_confidence = Some(0.9);
        track.bytes_downloaded = 1024;
        track.total_bytes = 4096;
        store.update_track(&track).unwrap();

        let loaded = store.get_track(&track.id).unwrap().unwrap();
        assert_eq!(loaded.status, TrackStatus::Downloading);
        assert_eq!(loaded.source_video_id.as_deref(), Some("v42"));
        assert_eq!(loaded.match_confidence, Some(0.9));
        assert_eq!(loaded.bytes_downloaded, 1024);
        assert_eq!(loaded.total_bytes, 4096);
    }

    #[test]
    fn test_progress_update_leaves_status_alone() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();

        let mut track = make_track(&batch.id, "fp1");
        track.status = TrackStatus::Downloading;
        store.insert_tracks_bulk(std::slice::from_ref(&track)).unwrap();

        store.update_track_progress(&track.id, 512, 2048).unwrap();

        let loaded = store.get_track(&track.id).unwrap().unwrap();
        assert_eq!(loaded.status, TrackStatus::Downloading);
        assert_eq!(loaded.bytes_downloaded, 512);
        assert_eq!(loaded.total_bytes, 2048);
    }

    #[test]
    fn test_queued_tracks_fifo_order() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();

        let mut a = make_track(&batch.id, "fp-a");
        let mut b = make_track(&batch.id, "fp-b");
        a.status = TrackStatus::Queued;
        b.status = TrackStatus::Queued;
        a.updated_at = 200;
        b.updated_at = 100;
        store.insert_tracks_bulk(&[a.clone(), b.clone()]).unwrap();

        let queued = store.get_queued_tracks().unwrap();
        assert_eq!(queued.len(), 2);
        // b was touched earlier, so it is dispatched first.
        assert_eq!(queued[0].id, b.id);
        assert_eq!(queued[1].id, a.id);
    }

    #[test]
    fn test_stalled_tracks_query() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();

        let mut dispatching = make_track(&batch.id, "fp-1");
        dispatching.status = TrackStatus::Dispatching;
        let mut downloading = make_track(&batch.id, "fp-2");
        downloading.status = TrackStatus::Downloading;
        let mut queued = make_track(&batch.id, "fp-3");
        queued.status = TrackStatus::Queued;
        store
            .insert_tracks_bulk(&[dispatching.clone(), downloading.clone(), queued])
            .unwrap();

        let stalled = store.get_stalled_tracks().unwrap();
        let ids: Vec<_> = stalled.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(stalled.len(), 2);
        assert!(ids.contains(&dispatching.id.as_str()));
        assert!(ids.contains(&downloading.id.as_str()));
    }

    #[test]
    fn test_batch_status_counts() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();

        let statuses = [
            TrackStatus::Completed,
            TrackStatus::Completed,
            TrackStatus::Failed,
            TrackStatus::MatchedLowConfidence,
            TrackStatus::Downloading,
            TrackStatus::Queued,
            TrackStatus::Extracted,
        ];
        let tracks: Vec<Track> = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut t = make_track(&batch.id, &format!("fp-{}", i));
                t.status = *status;
                t
            })
            .collect();
        store.insert_tracks_bulk(&tracks).unwrap();

        let counts = store.batch_status_counts(&batch.id).unwrap();
        assert_eq!(counts.total, 7);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.low_confidence, 1);
        assert_eq!(counts.active, 2); // Downloading + Queued; Extracted is not active
    }

    #[test]
    fn test_batch_with_tracks() {
        let store = SqliteImportStore::in_memory().unwrap();
        let batch = make_batch();
        store.insert_batch(&batch).unwrap();
        store
            .insert_tracks_bulk(&[make_track(&batch.id, "fp-1"), make_track(&batch.id, "fp-2")])
            .unwrap();

        let (loaded, tracks) = store.get_batch_with_tracks(&batch.id).unwrap().unwrap();
        assert_eq!(loaded.id, batch.id);
        assert_eq!(tracks.len(), 2);

        assert!(store.get_batch_with_tracks("missing").unwrap().is_none());
    }
}
