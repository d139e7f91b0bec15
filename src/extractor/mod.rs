//! Catalog extractors.
//!
//! Three strategies turn a submitted URL into an ordered list of track
//! candidates: the video platform's playlist API, the authenticated catalog
//! API with an HTML-scrape fallback, and a bare page scrape. Extraction
//! never propagates errors; a failed strategy logs and yields an empty
//! list, and the orchestrator fails the batch on emptiness.

mod catalog;
mod playlist;
mod scrape;

pub use catalog::{CatalogApiConfig, CatalogExtractor};
pub use playlist::PlaylistExtractor;
pub use scrape::PageExtractor;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upper bound on candidates per batch; extraction stops at the cap and
/// submission rejects anything that still exceeds it.
pub const MAX_CANDIDATES: usize = 500;

/// Origin catalog of a submitted URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePlatform {
    /// Video platform playlist (entries already carry a video id).
    Video,
    /// Streaming catalog with an authenticated API.
    Catalog,
    /// Anything else: scrape the page.
    Page,
}

impl SourcePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::Video => "video",
            SourcePlatform::Catalog => "catalog",
            SourcePlatform::Page => "page",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "video" => Some(SourcePlatform::Video),
            "catalog" => Some(SourcePlatform::Catalog),
            "page" => Some(SourcePlatform::Page),
            _ => None,
        }
    }

    /// Guess the platform from the URL shape.
    pub fn detect(url: &str) -> Self {
        if url.contains("list=") || url.contains("/playlists/") {
            return SourcePlatform::Video;
        }
        if url.contains("/playlist/")
            || url.contains("/album/")
            || url.contains(":playlist:")
            || url.contains(":album:")
        {
            return SourcePlatform::Catalog;
        }
        SourcePlatform::Page
    }
}

/// A track candidate produced by extraction, before matching.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackCandidate {
    pub title: String,
    pub artist: String,
    pub duration_seconds: Option<i64>,
    pub thumbnail_url: Option<String>,
    /// Set when the source already names a downloadable video id; enables
    /// the mapper fast path.
    pub source_video_id: Option<String>,
}

impl TrackCandidate {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            duration_seconds: None,
            thumbnail_url: None,
            source_video_id: None,
        }
    }
}

/// Dispatching facade over the three extractor variants.
pub struct Extractor {
    playlist: PlaylistExtractor,
    catalog: CatalogExtractor,
    page: PageExtractor,
}

impl Extractor {
    pub fn new(playlist: PlaylistExtractor, catalog: CatalogExtractor, page: PageExtractor) -> Self {
        Self {
            playlist,
            catalog,
            page,
        }
    }

    /// Extract candidates for `url`. Failures are logged and collapse to an
    /// empty list; the result is capped at [`MAX_CANDIDATES`].
    pub async fn extract(&self, url: &str, platform: SourcePlatform) -> Vec<TrackCandidate> {
        let result = match platform {
            SourcePlatform::Video => self.playlist.extract(url).await,
            SourcePlatform::Catalog => self.catalog.extract(url).await,
            SourcePlatform::Page => self.page.extract(url).await,
        };
        let mut candidates = match result {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Extraction failed for {}: {:#}", url, e);
                Vec::new()
            }
        };
        candidates.truncate(MAX_CANDIDATES);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        assert_eq!(
            SourcePlatform::detect("https://tube.example/playlist?list=PL123"),
            SourcePlatform::Video
        );
        assert_eq!(
            SourcePlatform::detect("https://music.example/playlist/37i9dQ"),
            SourcePlatform::Catalog
        );
        assert_eq!(
            SourcePlatform::detect("catalog:album:4aawyAB"),
            SourcePlatform::Catalog
        );
        assert_eq!(
            SourcePlatform::detect("https://songs.example/some/page"),
            SourcePlatform::Page
        );
    }

    #[test]
    fn test_platform_str_round_trip() {
        for platform in [
            SourcePlatform::Video,
            SourcePlatform::Catalog,
            SourcePlatform::Page,
        ] {
            assert_eq!(SourcePlatform::from_str(platform.as_str()), Some(platform));
        }
        assert_eq!(SourcePlatform::from_str("bogus"), None);
    }
}
