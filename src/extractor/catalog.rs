//! Authenticated catalog extractor (variant B).
//!
//! Talks to the streaming catalog's API over a client-credentials bearer
//! token, and falls back to scraping the public web page when the API
//! fails or returns nothing. Accepts both web URLs and URI-style
//! identifiers for playlists and albums.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::scrape::{
    candidate_from_meta_tags, candidates_from_json_ld, candidates_from_track_rows, json_ld_blocks,
};
use super::{TrackCandidate, MAX_CANDIDATES};

/// Refresh the bearer token when it expires within this window.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Endpoint and credential configuration for the catalog API.
#[derive(Debug, Clone)]
pub struct CatalogApiConfig {
    /// API base, e.g. "https://api.music.example/v1".
    pub api_base: String,
    /// Client-credentials token endpoint.
    pub token_url: String,
    /// Public web base for the scrape fallback.
    pub web_base: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatalogKind {
    Playlist,
    Album,
}

impl CatalogKind {
    fn path_segment(&self) -> &'static str {
        match self {
            CatalogKind::Playlist => "playlist",
            CatalogKind::Album => "album",
        }
    }
}

struct BearerToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    #[serde(default)]
    duration_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    track: Option<ApiTrack>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracksPage {
    #[serde(default)]
    items: Vec<PlaylistEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlbumTracksPage {
    #[serde(default)]
    items: Vec<ApiTrack>,
    next: Option<String>,
}

pub struct CatalogExtractor {
    client: reqwest::Client,
    config: CatalogApiConfig,
    /// Refresh is synchronized so concurrent extractions share one token.
    token: Mutex<Option<BearerToken>>,
}

impl CatalogExtractor {
    pub fn new(client: reqwest::Client, config: CatalogApiConfig) -> Self {
        Self {
            client,
            config,
            token: Mutex::new(None),
        }
    }

    pub async fn extract(&self, url: &str) -> Result<Vec<TrackCandidate>> {
        let (kind, id) =
            parse_catalog_ref(url).ok_or_else(|| anyhow!("Unsupported catalog URL: {}", url))?;

        match self.extract_via_api(kind, &id).await {
            Ok(candidates) if !candidates.is_empty() => return Ok(candidates),
            Ok(_) => debug!("Catalog API returned no tracks for {}:{}", kind.path_segment(), id),
            Err(e) => warn!("Catalog API extraction failed for {}: {:#}", id, e),
        }

        self.extract_via_scrape(kind, &id).await
    }

    // === API path ===

    async fn extract_via_api(&self, kind: CatalogKind, id: &str) -> Result<Vec<TrackCandidate>> {
        let token = self.ensure_token().await?;
        let mut candidates = Vec::new();

        let mut next_url = Some(match kind {
            CatalogKind::Playlist => {
                format!("{}/playlists/{}/tracks?limit=100", self.config.api_base, id)
            }
            CatalogKind::Album => {
                format!("{}/albums/{}/tracks?limit=50", self.config.api_base, id)
            }
        });

        while let Some(url) = next_url.take() {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .context("Failed to fetch catalog tracks page")?;
            if !response.status().is_success() {
                anyhow::bail!("Catalog tracks request failed with status {}", response.status());
            }

            match kind {
                CatalogKind::Playlist => {
                    let page: PlaylistTracksPage = response
                        .json()
                        .await
                        .context("Failed to parse playlist tracks page")?;
                    for entry in page.items.into_iter() {
                        if let Some(track) = entry.track {
                            candidates.push(candidate_from_api_track(track));
                        }
                    }
                    next_url = page.next;
                }
                CatalogKind::Album => {
                    let page: AlbumTracksPage = response
                        .json()
                        .await
                        .context("Failed to parse album tracks page")?;
                    candidates.extend(page.items.into_iter().map(candidate_from_api_track));
                    next_url = page.next;
                }
            }

            if candidates.len() >= MAX_CANDIDATES {
                break;
            }
        }

        Ok(candidates)
    }

    /// Return a valid bearer token, refreshing it when missing or within
    /// 60 s of expiry. Held under a mutex so only one refresh runs.
    async fn ensure_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at.saturating_duration_since(Instant::now()) > TOKEN_REFRESH_MARGIN {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .context("Failed to request catalog token")?;
        if !response.status().is_success() {
            anyhow::bail!("Catalog token request failed with status {}", response.status());
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .context("Failed to parse catalog token response")?;

        let access_token = parsed.access_token.clone();
        *guard = Some(BearerToken {
            access_token: parsed.access_token,
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
        });
        Ok(access_token)
    }

    // === Scrape fallback ===

    async fn extract_via_scrape(&self, kind: CatalogKind, id: &str) -> Result<Vec<TrackCandidate>> {
        let url = format!("{}/{}/{}", self.config.web_base, kind.path_segment(), id);
        let html = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch catalog page")?
            .text()
            .await
            .context("Failed to read catalog page body")?;

        for block in json_ld_blocks(&html) {
            let candidates = candidates_from_json_ld(&block);
            if !candidates.is_empty() {
                debug!("Scraped {} candidates from JSON-LD for {}", candidates.len(), id);
                return Ok(candidates);
            }
        }

        let rows = candidates_from_track_rows(&html);
        if !rows.is_empty() {
            debug!("Scraped {} candidates from track rows for {}", rows.len(), id);
            return Ok(rows);
        }

        // Last ditch: one candidate from the page title and description.
        Ok(candidate_from_meta_tags(&html).into_iter().collect())
    }
}

fn candidate_from_api_track(track: ApiTrack) -> TrackCandidate {
    let artist = track
        .artists
        .first()
        .map(|a| a.name.clone())
        .unwrap_or_default();
    let mut candidate = TrackCandidate::new(track.name, artist);
    candidate.duration_seconds = track.duration_ms.map(|ms| ms / 1000);
    candidate
}

/// Parse a playlist/album reference from a web URL
/// (`https://.../playlist/{id}`) or a URI (`catalog:playlist:{id}`).
fn parse_catalog_ref(url: &str) -> Option<(CatalogKind, String)> {
    for (kind, needle) in [
        (CatalogKind::Playlist, "/playlist/"),
        (CatalogKind::Album, "/album/"),
    ] {
        if let Some(idx) = url.find(needle) {
            let rest = &url[idx + needle.len()..];
            let end = rest.find(['?', '&', '/', '#']).unwrap_or(rest.len());
            if end > 0 {
                return Some((kind, rest[..end].to_string()));
            }
        }
    }

    // URI style: "<scheme>:playlist:<id>" / "<scheme>:album:<id>".
    let parts: Vec<&str> = url.split(':').collect();
    if parts.len() == 3 && !parts[2].is_empty() {
        let kind = match parts[1] {
            "playlist" => Some(CatalogKind::Playlist),
            "album" => Some(CatalogKind::Album),
            _ => None,
        }?;
        return Some((kind, parts[2].to_string()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_web_urls() {
        assert_eq!(
            parse_catalog_ref("https://music.example/playlist/37i9dQZF?si=x"),
            Some((CatalogKind::Playlist, "37i9dQZF".to_string()))
        );
        assert_eq!(
            parse_catalog_ref("https://music.example/album/4aawyAB9"),
            Some((CatalogKind::Album, "4aawyAB9".to_string()))
        );
    }

    #[test]
    fn test_parse_uris() {
        assert_eq!(
            parse_catalog_ref("catalog:playlist:37i9dQZF"),
            Some((CatalogKind::Playlist, "37i9dQZF".to_string()))
        );
        assert_eq!(
            parse_catalog_ref("catalog:album:4aawyAB9"),
            Some((CatalogKind::Album, "4aawyAB9".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_catalog_ref("https://music.example/artist/xyz"), None);
        assert_eq!(parse_catalog_ref("catalog:artist:xyz"), None);
        assert_eq!(parse_catalog_ref("catalog:playlist:"), None);
        assert_eq!(parse_catalog_ref("not a url"), None);
    }

    #[test]
    fn test_candidate_from_api_track() {
        let track = ApiTrack {
            name: "Song".to_string(),
            artists: vec![
                ApiArtist {
                    name: "Primary".to_string(),
                },
                ApiArtist {
                    name: "Featured".to_string(),
                },
            ],
            duration_ms: Some(215_500),
        };
        let candidate = candidate_from_api_track(track);
        assert_eq!(candidate.title, "Song");
        assert_eq!(candidate.artist, "Primary");
        assert_eq!(candidate.duration_seconds, Some(215));
        assert!(candidate.source_video_id.is_none());
    }

    #[test]
    fn test_playlist_page_parses() {
        let json = r#"{
            "items": [
                {"track": {"name": "One", "artists": [{"name": "A"}], "duration_ms": 1000}},
                {"track": null}
            ],
            "next": "https://api.music.example/v1/playlists/p/tracks?offset=100&limit=100"
        }"#;
        let page: PlaylistTracksPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items[1].track.is_none());
        assert!(page.next.is_some());
    }
}
