//! HTTP facade routes.
//!
//! JSON in, JSON out, no authentication; the facade binds to localhost.
//! Failures travel in-band as `{"error": "..."}` with HTTP 200 so the UI
//! has one decoding path.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::mapper::{is_rejected_title, MAX_MATCH_DURATION_SECS};
use crate::orchestrator::{ActionKind, BatchManager};
use crate::video_platform::{StreamItem, VideoApiClient};

use super::state::ServerState;
use super::tasks::{video_id_from_url, TaskRegistry};

const SUGGESTION_LIMIT: usize = 10;

pub fn api_router() -> Router<ServerState> {
    Router::new()
        .route("/api/search", post(search))
        .route("/api/suggestions", post(suggestions))
        .route("/api/download", post(download))
        .route("/api/prefetch", post(prefetch))
        .route("/api/progress/{id}", get(progress))
        .route("/api/import", post(import))
        .route("/api/import/list", get(import_list))
        .route("/api/import/status/{id}", get(import_status))
        .route("/api/import/action", post(import_action))
        .route("/api/library", get(library))
        .route("/api/music/{filename}", get(stream_music))
        .route("/api/delete", post(delete_file))
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "error": message.into() }))
}

// =============================================================================
// Search & suggestions
// =============================================================================

#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
}

#[derive(Debug, Serialize)]
struct SearchResult {
    title: String,
    artist: String,
    duration: Option<i64>,
    url: String,
    thumbnail: Option<String>,
}

impl SearchResult {
    fn from_item(item: &StreamItem) -> Self {
        Self {
            title: item.title.clone(),
            artist: item.uploader_name.clone().unwrap_or_default(),
            duration: item.duration.filter(|d| *d >= 0),
            url: item.url.clone(),
            thumbnail: item.thumbnail.clone(),
        }
    }
}

fn is_song_like(item: &StreamItem) -> bool {
    if item.is_short_form_url() || item.is_short {
        return false;
    }
    match item.duration {
        Some(d) if d > 0 && d <= MAX_MATCH_DURATION_SECS => {}
        _ => return false,
    }
    !is_rejected_title(&item.title)
}

/// POST /api/search - the best single result for a query.
async fn search(
    State(api): State<VideoApiClient>,
    Json(body): Json<QueryBody>,
) -> impl IntoResponse {
    match api.search(&body.query).await {
        Ok(items) => match items.iter().find(|i| is_song_like(i)) {
            Some(item) => Json(json!(SearchResult::from_item(item))),
            None => error_body("no results"),
        },
        Err(e) => {
            warn!("Search failed: {:#}", e);
            error_body("search failed")
        }
    }
}

/// POST /api/suggestions - a short list of plausible results.
async fn suggestions(
    State(api): State<VideoApiClient>,
    Json(body): Json<QueryBody>,
) -> impl IntoResponse {
    match api.search(&body.query).await {
        Ok(items) => {
            let results: Vec<SearchResult> = items
                .iter()
                .filter(|i| !i.is_short_form_url() && !i.is_short)
                .take(SUGGESTION_LIMIT)
                .map(SearchResult::from_item)
                .collect();
            Json(json!(results))
        }
        Err(e) => {
            warn!("Suggestions failed: {:#}", e);
            error_body("search failed")
        }
    }
}

// =============================================================================
// Single-song download
// =============================================================================

#[derive(Debug, Deserialize)]
struct DownloadBody {
    url: String,
    #[serde(default)]
    title: String,
    /// Accepted for UI compatibility; audio is stored as delivered.
    #[serde(default)]
    #[allow(dead_code)]
    quality: Option<String>,
    #[serde(default)]
    codec: Option<String>,
}

/// POST /api/download - start an on-demand download task.
async fn download(
    State(tasks): State<Arc<TaskRegistry>>,
    Json(body): Json<DownloadBody>,
) -> impl IntoResponse {
    let title = if body.title.is_empty() {
        body.url.clone()
    } else {
        body.title
    };
    let codec = body.codec.unwrap_or_else(|| "mp3".to_string());
    let task_id = tasks.start(body.url, title, codec);
    Json(json!({ "task_id": task_id }))
}

#[derive(Debug, Deserialize)]
struct PrefetchBody {
    url: String,
}

/// POST /api/prefetch - warm the resolver cache for a URL.
async fn prefetch(
    State(manager): State<Arc<BatchManager>>,
    Json(body): Json<PrefetchBody>,
) -> impl IntoResponse {
    let Some(video_id) = video_id_from_url(&body.url) else {
        return error_body("unsupported URL");
    };
    let cached = manager.resolver().is_cached(&video_id);
    if !cached {
        manager.resolver().prefetch(&video_id);
    }
    Json(json!({ "prefetching": !cached, "cached": cached }))
}

/// GET /api/progress/{id} - poll a download task.
async fn progress(
    State(tasks): State<Arc<TaskRegistry>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match tasks.get(&task_id) {
        Some(snapshot) => Json(json!(snapshot)),
        None => error_body("unknown task"),
    }
}

// =============================================================================
// Imports
// =============================================================================

#[derive(Debug, Deserialize)]
struct ImportBody {
    url: String,
}

/// POST /api/import - submit a playlist/album URL as a batch.
async fn import(
    State(manager): State<Arc<BatchManager>>,
    Json(body): Json<ImportBody>,
) -> impl IntoResponse {
    match manager.submit_batch(&body.url).await {
        Ok(result) => Json(json!({
            "success": true,
            "batchId": result.batch_id,
            "trackCount": result.track_count,
        })),
        Err(e) => {
            debug!("Import of {} failed: {:#}", body.url, e);
            Json(json!({ "success": false, "error": e.to_string() }))
        }
    }
}

/// GET /api/import/list - all batches, newest first.
async fn import_list(State(manager): State<Arc<BatchManager>>) -> impl IntoResponse {
    match manager.store().list_batches() {
        Ok(batches) => Json(json!(batches)),
        Err(e) => {
            warn!("Batch listing failed: {:#}", e);
            error_body("storage error")
        }
    }
}

/// GET /api/import/status/{id} - one batch with its tracks.
async fn import_status(
    State(manager): State<Arc<BatchManager>>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    match manager.store().get_batch_with_tracks(&batch_id) {
        Ok(Some((batch, tracks))) => Json(json!({ "batch": batch, "tracks": tracks })),
        Ok(None) => error_body("batch not found"),
        Err(e) => {
            warn!("Batch status failed: {:#}", e);
            error_body("storage error")
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActionBody {
    track_id: String,
    action: String,
    #[serde(default)]
    video_id: Option<String>,
}

/// POST /api/import/action - operator decision on a low-confidence match.
async fn import_action(
    State(manager): State<Arc<BatchManager>>,
    Json(body): Json<ActionBody>,
) -> impl IntoResponse {
    let Some(kind) = ActionKind::from_str(&body.action) else {
        return Json(json!({ "success": false, "error": "unknown action" }));
    };
    let response = manager
        .handle_action(&body.track_id, kind, body.video_id)
        .await;
    Json(json!(response))
}

// =============================================================================
// Library
// =============================================================================

const AUDIO_EXTENSIONS: [&str; 3] = ["mp3", "opus", "ogg"];

#[derive(Debug, Serialize)]
struct LibraryEntry {
    filename: String,
    title: String,
    size_human: String,
    codec: String,
}

/// GET /api/library - final audio files in the music directory.
async fn library(State(manager): State<Arc<BatchManager>>) -> impl IntoResponse {
    let mut entries = Vec::new();
    let mut dir = match tokio::fs::read_dir(manager.music_dir()).await {
        Ok(dir) => dir,
        Err(_) => return Json(json!(entries)),
    };

    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !AUDIO_EXTENSIONS.contains(&ext) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let filename = entry.file_name().to_string_lossy().to_string();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.clone());
        let size = byte_unit::Byte::from_u64(metadata.len())
            .get_appropriate_unit(byte_unit::UnitType::Decimal);
        entries.push(LibraryEntry {
            filename,
            title,
            size_human: format!("{:.1}", size),
            codec: ext.to_string(),
        });
    }

    entries.sort_by(|a, b| a.filename.cmp(&b.filename));
    Json(json!(entries))
}

/// Reject anything that could escape the music directory.
fn safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains('/')
        && !filename.contains('\\')
        && !filename.contains("..")
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("mp3") => "audio/mpeg",
        Some("opus") => "audio/opus",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// GET /api/music/{filename} - stream an audio file.
async fn stream_music(
    State(manager): State<Arc<BatchManager>>,
    Path(filename): Path<String>,
) -> impl IntoResponse {
    if !safe_filename(&filename) {
        return (StatusCode::BAD_REQUEST, "bad filename").into_response();
    }
    let path = manager.music_dir().join(&filename);
    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            let stream = ReaderStream::new(file);
            (
                [(header::CONTENT_TYPE, content_type_for(&filename))],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    filename: String,
}

/// POST /api/delete - remove a file from the library.
async fn delete_file(
    State(manager): State<Arc<BatchManager>>,
    Json(body): Json<DeleteBody>,
) -> impl IntoResponse {
    if !safe_filename(&body.filename) {
        return Json(json!({ "success": false, "error": "bad filename" }));
    }
    let path = manager.music_dir().join(&body.filename);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Json(json!({ "success": true })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_filename() {
        assert!(safe_filename("song.mp3"));
        assert!(safe_filename("My Song - live.opus"));
        assert!(!safe_filename(""));
        assert!(!safe_filename("../etc/passwd"));
        assert!(!safe_filename("a/b.mp3"));
        assert!(!safe_filename("a\\b.mp3"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("x.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("x.opus"), "audio/opus");
        assert_eq!(content_type_for("x.ogg"), "audio/ogg");
        assert_eq!(content_type_for("x.txt"), "application/octet-stream");
    }

    #[test]
    fn test_is_song_like() {
        let ok = StreamItem {
            url: "/watch?v=a".to_string(),
            title: "A Song".to_string(),
            uploader_name: None,
            duration: Some(200),
            thumbnail: None,
            is_short: false,
        };
        assert!(is_song_like(&ok));

        let long = StreamItem {
            duration: Some(1000),
            ..ok.clone()
        };
        assert!(!is_song_like(&long));

        let rejected = StreamItem {
            title: "A Song reaction".to_string(),
            ..ok.clone()
        };
        assert!(!is_song_like(&rejected));

        let short = StreamItem {
            url: "/shorts/a".to_string(),
            ..ok
        };
        assert!(!is_song_like(&short));
    }
}
