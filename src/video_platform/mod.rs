//! Client for the video platform's public JSON API.
//!
//! The same API shape is served by a primary instance and an ordered list
//! of mirror instances; the resolver rotates through mirrors when the
//! primary fails. Endpoints used here: `/playlists/{id}` (paginated),
//! `/search?q=`, `/streams/{id}`.

use anyhow::{Context, Result};
use serde::Deserialize;

/// A single entry in a playlist page or search result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItem {
    /// Relative watch URL, e.g. "/watch?v=abc123" or "/shorts/abc123".
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub uploader_name: Option<String>,
    /// Duration in seconds; -1 or absent when unknown.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub is_short: bool,
}

impl StreamItem {
    /// Extract the video id from the item's URL.
    pub fn video_id(&self) -> Option<String> {
        if let Some(idx) = self.url.find("v=") {
            let rest = &self.url[idx + 2..];
            let end = rest.find('&').unwrap_or(rest.len());
            return Some(rest[..end].to_string());
        }
        // Fall back to the last path segment for /shorts/{id} style URLs.
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    /// Returns true if the URL itself marks short-form content.
    pub fn is_short_form_url(&self) -> bool {
        self.url.contains("/shorts/")
    }
}

/// One page of a playlist.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistPage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub related_streams: Vec<StreamItem>,
    /// Opaque continuation token; absent on the last page.
    #[serde(default)]
    pub nextpage: Option<String>,
}

/// An audio rendition of a stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStream {
    pub url: String,
    #[serde(default)]
    pub bitrate: i64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A video rendition of a stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStream {
    pub url: String,
}

/// Full stream metadata for a single video id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamsResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub audio_streams: Vec<AudioStream>,
    #[serde(default)]
    pub video_streams: Vec<VideoStream>,
}

impl StreamsResponse {
    /// Pick the best direct URL: the audio stream with the highest average
    /// bitrate, else the first video stream.
    pub fn best_stream_url(&self) -> Option<&str> {
        self.audio_streams
            .iter()
            .max_by_key(|s| s.bitrate)
            .map(|s| s.url.as_str())
            .or_else(|| self.video_streams.first().map(|s| s.url.as_str()))
    }
}

/// HTTP client for one video platform API instance.
#[derive(Clone)]
pub struct VideoApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl VideoApiClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch a page of a playlist. Pass the previous page's `nextpage`
    /// token to continue.
    pub async fn playlist_page(
        &self,
        playlist_id: &str,
        nextpage: Option<&str>,
    ) -> Result<PlaylistPage> {
        let url = match nextpage {
            Some(token) => format!(
                "{}/nextpage/playlists/{}?nextpage={}",
                self.base_url,
                playlist_id,
                urlencoding::encode(token)
            ),
            None => format!("{}/playlists/{}", self.base_url, playlist_id),
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch playlist page")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Playlist {} request failed with status {}",
                playlist_id,
                response.status()
            );
        }
        response
            .json()
            .await
            .context("Failed to parse playlist response")
    }

    /// Run a search query, returning music-ish stream items.
    pub async fn search(&self, query: &str) -> Result<Vec<StreamItem>> {
        #[derive(Deserialize)]
        struct SearchResponse {
            #[serde(default)]
            items: Vec<StreamItem>,
        }

        let url = format!(
            "{}/search?q={}&filter=videos",
            self.base_url,
            urlencoding::encode(query)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to run search")?;
        if !response.status().is_success() {
            anyhow::bail!("Search request failed with status {}", response.status());
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;
        Ok(parsed.items)
    }

    /// Fetch stream metadata for a video id.
    pub async fn streams(&self, video_id: &str) -> Result<StreamsResponse> {
        let url = format!("{}/streams/{}", self.base_url, video_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch stream metadata")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Streams request for {} failed with status {}",
                video_id,
                response.status()
            );
        }
        response
            .json()
            .await
            .context("Failed to parse streams response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(url: &str) -> StreamItem {
        StreamItem {
            url: url.to_string(),
            title: "t".to_string(),
            uploader_name: None,
            duration: None,
            thumbnail: None,
            is_short: false,
        }
    }

    #[test]
    fn test_video_id_from_watch_url() {
        assert_eq!(item("/watch?v=abc123").video_id().as_deref(), Some("abc123"));
        assert_eq!(
            item("/watch?v=abc123&list=xyz").video_id().as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_video_id_from_path_url() {
        assert_eq!(item("/shorts/zzz9").video_id().as_deref(), Some("zzz9"));
    }

    #[test]
    fn test_short_form_url_detection() {
        assert!(item("/shorts/zzz9").is_short_form_url());
        assert!(!item("/watch?v=abc").is_short_form_url());
    }

    #[test]
    fn test_best_stream_prefers_highest_bitrate_audio() {
        let streams = StreamsResponse {
            title: None,
            audio_streams: vec![
                AudioStream {
                    url: "low".to_string(),
                    bitrate: 64_000,
                    mime_type: None,
                },
                AudioStream {
                    url: "high".to_string(),
                    bitrate: 160_000,
                    mime_type: None,
                },
            ],
            video_streams: vec![VideoStream {
                url: "video".to_string(),
            }],
        };
        assert_eq!(streams.best_stream_url(), Some("high"));
    }

    #[test]
    fn test_best_stream_falls_back_to_video() {
        let streams = StreamsResponse {
            title: None,
            audio_streams: vec![],
            video_streams: vec![VideoStream {
                url: "video".to_string(),
            }],
        };
        assert_eq!(streams.best_stream_url(), Some("video"));
    }

    #[test]
    fn test_best_stream_none() {
        let streams = StreamsResponse {
            title: None,
            audio_streams: vec![],
            video_streams: vec![],
        };
        assert_eq!(streams.best_stream_url(), None);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = VideoApiClient::new(crate::http::build_client(), "http://api.example/");
        assert_eq!(client.base_url(), "http://api.example");
    }

    #[test]
    fn test_playlist_page_parses() {
        let json = r#"{
            "name": "Mix",
            "relatedStreams": [
                {"url": "/watch?v=a1", "title": "One", "uploaderName": "U", "duration": 200},
                {"url": "/shorts/a2", "title": "Two", "isShort": true}
            ],
            "nextpage": "token"
        }"#;
        let page: PlaylistPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.related_streams.len(), 2);
        assert_eq!(page.nextpage.as_deref(), Some("token"));
        assert!(page.related_streams[1].is_short);
    }
}
