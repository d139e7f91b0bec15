//! HTML scraping helpers and the bare page extractor (variant C).
//!
//! Scraping is a fallback, so the parsers are deliberately tolerant: they
//! work on raw markup with regexes and JSON-LD payloads rather than a full
//! DOM, and anything they cannot read is simply skipped.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;

use super::TrackCandidate;

lazy_static! {
    static ref META_TAG: Regex =
        Regex::new(r#"<meta[^>]*property=["']([^"']+)["'][^>]*content=["']([^"']*)["']"#).unwrap();
    static ref META_TAG_REVERSED: Regex =
        Regex::new(r#"<meta[^>]*content=["']([^"']*)["'][^>]*property=["']([^"']+)["']"#).unwrap();
    static ref JSON_LD: Regex =
        Regex::new(r#"(?s)<script[^>]*type=["']application/ld\+json["'][^>]*>(.*?)</script>"#)
            .unwrap();
    static ref TRACK_ROW: Regex = Regex::new(
        r#"(?s)<a[^>]*href=["'][^"']*/track/[^"']*["'][^>]*>([^<]+)</a>.{0,400}?<a[^>]*href=["'][^"']*/artist/[^"']*["'][^>]*>([^<]+)</a>"#
    )
    .unwrap();
}

/// Read an OpenGraph-style `<meta property=... content=...>` tag, accepting
/// either attribute order.
pub fn meta_property(html: &str, property: &str) -> Option<String> {
    for caps in META_TAG.captures_iter(html) {
        if &caps[1] == property && !caps[2].trim().is_empty() {
            return Some(decode_entities(caps[2].trim()));
        }
    }
    for caps in META_TAG_REVERSED.captures_iter(html) {
        if &caps[2] == property && !caps[1].trim().is_empty() {
            return Some(decode_entities(caps[1].trim()));
        }
    }
    None
}

/// Parse every JSON-LD block on the page.
pub fn json_ld_blocks(html: &str) -> Vec<serde_json::Value> {
    JSON_LD
        .captures_iter(html)
        .filter_map(|caps| serde_json::from_str(caps[1].trim()).ok())
        .collect()
}

/// Extract candidates from a JSON-LD `MusicPlaylist` / `MusicAlbum` block.
pub fn candidates_from_json_ld(value: &serde_json::Value) -> Vec<TrackCandidate> {
    let type_matches = value
        .get("@type")
        .and_then(|t| t.as_str())
        .map(|t| t == "MusicPlaylist" || t == "MusicAlbum")
        .unwrap_or(false);
    if !type_matches {
        return Vec::new();
    }

    let album_artist = value
        .get("byArtist")
        .and_then(artist_name)
        .unwrap_or_default();

    // Track lists appear either directly under "track" or wrapped in an
    // ItemList under "track"/"tracks".
    let items = value
        .get("track")
        .or_else(|| value.get("tracks"))
        .map(|t| match t {
            serde_json::Value::Array(items) => items.clone(),
            serde_json::Value::Object(_) => t
                .get("itemListElement")
                .and_then(|e| e.as_array())
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        })
        .unwrap_or_default();

    items
        .iter()
        .filter_map(|entry| {
            // ItemList entries nest the track under "item".
            let track = entry.get("item").unwrap_or(entry);
            let title = track.get("name")?.as_str()?.trim().to_string();
            if title.is_empty() {
                return None;
            }
            let artist = track
                .get("byArtist")
                .and_then(artist_name)
                .unwrap_or_else(|| album_artist.clone());
            Some(TrackCandidate::new(title, artist))
        })
        .collect()
}

fn artist_name(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Array(items) => items.first().and_then(artist_name),
        serde_json::Value::Object(_) => value
            .get("name")
            .and_then(|n| n.as_str())
            .map(|s| s.trim().to_string()),
        _ => None,
    }
}

/// Extract candidates from track-row markup: a `/track/` anchor followed by
/// an `/artist/` anchor.
pub fn candidates_from_track_rows(html: &str) -> Vec<TrackCandidate> {
    TRACK_ROW
        .captures_iter(html)
        .map(|caps| {
            TrackCandidate::new(
                decode_entities(caps[1].trim()),
                decode_entities(caps[2].trim()),
            )
        })
        .filter(|c| !c.title.is_empty())
        .collect()
}

/// Minimal HTML entity decoding for scraped text.
fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// Bare page extractor (variant C): `og:` meta tags only, at most one
/// candidate.
pub struct PageExtractor {
    client: reqwest::Client,
}

impl PageExtractor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn extract(&self, url: &str) -> Result<Vec<TrackCandidate>> {
        let html = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch page")?
            .text()
            .await
            .context("Failed to read page body")?;
        Ok(candidate_from_meta_tags(&html).into_iter().collect())
    }
}

/// Build a single candidate from `og:title` / `og:description` / `og:image`.
pub fn candidate_from_meta_tags(html: &str) -> Option<TrackCandidate> {
    let title = meta_property(html, "og:title")?;
    let description = meta_property(html, "og:description").unwrap_or_default();
    let mut candidate = TrackCandidate::new(title, first_description_segment(&description));
    candidate.thumbnail_url = meta_property(html, "og:image");
    Some(candidate)
}

/// The first segment of a page description, which on catalog pages is the
/// artist name ("Artist · Playlist · 50 songs").
pub fn first_description_segment(description: &str) -> String {
    description
        .split(['·', '•', ','])
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
        <meta property="og:title" content="Midnight Tape"/>
        <meta content="Some Artist · Playlist · 12 songs" property="og:description"/>
        <meta property="og:image" content="https://img.example/t.jpg"/>
        </head><body></body></html>
    "#;

    #[test]
    fn test_meta_property_both_orders() {
        assert_eq!(meta_property(PAGE, "og:title").as_deref(), Some("Midnight Tape"));
        assert_eq!(
            meta_property(PAGE, "og:description").as_deref(),
            Some("Some Artist · Playlist · 12 songs")
        );
        assert_eq!(meta_property(PAGE, "og:missing"), None);
    }

    #[test]
    fn test_candidate_from_meta_tags() {
        let candidate = candidate_from_meta_tags(PAGE).unwrap();
        assert_eq!(candidate.title, "Midnight Tape");
        assert_eq!(candidate.artist, "Some Artist");
        assert_eq!(
            candidate.thumbnail_url.as_deref(),
            Some("https://img.example/t.jpg")
        );
    }

    #[test]
    fn test_candidate_from_meta_tags_requires_title() {
        assert!(candidate_from_meta_tags("<html></html>").is_none());
    }

    #[test]
    fn test_first_description_segment() {
        assert_eq!(first_description_segment("Artist · Album · 2024"), "Artist");
        assert_eq!(first_description_segment("Just text"), "Just text");
        assert_eq!(first_description_segment(""), "");
    }

    #[test]
    fn test_json_ld_playlist() {
        let html = r#"
            <script type="application/ld+json">
            {
                "@type": "MusicPlaylist",
                "name": "Mix",
                "track": {
                    "itemListElement": [
                        {"item": {"name": "First Song", "byArtist": {"name": "A1"}}},
                        {"item": {"name": "Second Song", "byArtist": [{"name": "A2"}]}}
                    ]
                }
            }
            </script>
        "#;
        let blocks = json_ld_blocks(html);
        assert_eq!(blocks.len(), 1);
        let candidates = candidates_from_json_ld(&blocks[0]);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].title, "First Song");
        assert_eq!(candidates[0].artist, "A1");
        assert_eq!(candidates[1].artist, "A2");
    }

    #[test]
    fn test_json_ld_album_inherits_artist() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "@type": "MusicAlbum",
                "byArtist": {"name": "Band"},
                "track": [{"name": "Opener"}, {"name": "Closer"}]
            }"#,
        )
        .unwrap();
        let candidates = candidates_from_json_ld(&value);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].artist, "Band");
        assert_eq!(candidates[1].title, "Closer");
    }

    #[test]
    fn test_json_ld_wrong_type_ignored() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"@type": "WebSite", "name": "x"}"#).unwrap();
        assert!(candidates_from_json_ld(&value).is_empty());
    }

    #[test]
    fn test_track_rows() {
        let html = r#"
            <div><a href="/track/1a">Song One &amp; More</a>
                 <span><a href="/artist/9">Artist One</a></span></div>
            <div><a href="/track/2b">Song Two</a>
                 <span><a href="/artist/8">Artist Two</a></span></div>
        "#;
        let candidates = candidates_from_track_rows(html);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].title, "Song One & More");
        assert_eq!(candidates[0].artist, "Artist One");
        assert_eq!(candidates[1].title, "Song Two");
    }

    #[test]
    fn test_track_rows_none() {
        assert!(candidates_from_track_rows("<html></html>").is_empty());
    }
}
