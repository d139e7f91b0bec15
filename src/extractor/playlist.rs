//! Video-platform playlist extractor (variant A).
//!
//! Pages through the playlist API until the playlist is exhausted or the
//! candidate cap is hit. Every candidate carries its `source_video_id`, so
//! these tracks skip the mapper entirely.

use anyhow::{anyhow, Result};
use tracing::debug;

use super::{TrackCandidate, MAX_CANDIDATES};
use crate::video_platform::VideoApiClient;

pub struct PlaylistExtractor {
    api: VideoApiClient,
}

impl PlaylistExtractor {
    pub fn new(api: VideoApiClient) -> Self {
        Self { api }
    }

    pub async fn extract(&self, url: &str) -> Result<Vec<TrackCandidate>> {
        let playlist_id =
            extract_playlist_id(url).ok_or_else(|| anyhow!("No playlist id in URL: {}", url))?;

        let mut candidates = Vec::new();
        let mut nextpage: Option<String> = None;

        loop {
            let page = self
                .api
                .playlist_page(&playlist_id, nextpage.as_deref())
                .await?;
            let page_len = page.related_streams.len();

            for item in page.related_streams {
                let mut candidate = TrackCandidate::new(
                    item.title.clone(),
                    item.uploader_name.clone().unwrap_or_default(),
                );
                candidate.duration_seconds = item.duration.filter(|d| *d >= 0);
                candidate.thumbnail_url = item.thumbnail.clone();
                candidate.source_video_id = item.video_id();
                candidates.push(candidate);
                if candidates.len() >= MAX_CANDIDATES {
                    return Ok(candidates);
                }
            }

            match page.nextpage {
                Some(token) if page_len > 0 => nextpage = Some(token),
                _ => break,
            }
        }

        debug!(
            "Playlist {} extracted {} candidates",
            playlist_id,
            candidates.len()
        );
        Ok(candidates)
    }
}

/// Pull the playlist id out of a playlist URL: the `list` query parameter,
/// or the last path segment of a `/playlists/{id}` URL.
fn extract_playlist_id(url: &str) -> Option<String> {
    if let Some(idx) = url.find("list=") {
        let rest = &url[idx + 5..];
        let end = rest.find('&').unwrap_or(rest.len());
        if end > 0 {
            return Some(rest[..end].to_string());
        }
    }
    if let Some(idx) = url.find("/playlists/") {
        let rest = &url[idx + 11..];
        let end = rest.find(['?', '&', '/']).unwrap_or(rest.len());
        if end > 0 {
            return Some(rest[..end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_playlist_id_from_query() {
        assert_eq!(
            extract_playlist_id("https://tube.example/playlist?list=PL123abc").as_deref(),
            Some("PL123abc")
        );
        assert_eq!(
            extract_playlist_id("https://tube.example/watch?v=x&list=PL9&index=2").as_deref(),
            Some("PL9")
        );
    }

    #[test]
    fn test_extract_playlist_id_from_path() {
        assert_eq!(
            extract_playlist_id("https://api.example/playlists/PLxyz?page=1").as_deref(),
            Some("PLxyz")
        );
    }

    #[test]
    fn test_extract_playlist_id_missing() {
        assert_eq!(extract_playlist_id("https://tube.example/watch?v=abc"), None);
        assert_eq!(extract_playlist_id("https://tube.example/playlist?list="), None);
    }
}
