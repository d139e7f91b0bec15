//! Track fingerprinting and text normalization.
//!
//! A fingerprint is a SHA-256 digest over the sanitized title, artist and a
//! 5-second duration bucket. Sanitization strips the noise that catalog
//! metadata and video titles disagree on (bracketed qualifiers, "official
//! video" tags, punctuation) so that trivially differing spellings of the
//! same song collide.

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    /// Parenthesized and bracketed qualifiers: "(Official Video)", "[HD]".
    static ref BRACKETED: Regex = Regex::new(r"\([^)]*\)|\[[^\]]*\]").unwrap();
    /// Stop tokens that carry no identity. "high quality" goes first so the
    /// two-word phrase is removed before single-word passes see it.
    static ref STOP_TOKENS: Regex = Regex::new(
        r"(?i)\b(high quality|feat|ft|official|video|audio|remastered|lyrics|hq|hd)\b"
    )
    .unwrap();
    static ref NON_ALPHANUMERIC: Regex = Regex::new(r"[^a-z0-9\s]").unwrap();
    static ref MULTI_SPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref FILENAME_ALLOWED: Regex = Regex::new(r"[^A-Za-z0-9 _\-]").unwrap();
}

/// Normalize free text for matching and fingerprinting.
///
/// Lowercases, removes bracketed segments, drops stop-list tokens, strips
/// everything but alphanumerics and whitespace, collapses whitespace and
/// trims. Idempotent.
pub fn sanitize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let no_brackets = BRACKETED.replace_all(&lowered, " ");
    let no_stops = STOP_TOKENS.replace_all(&no_brackets, " ");
    let alnum = NON_ALPHANUMERIC.replace_all(&no_stops, "");
    MULTI_SPACE.replace_all(&alnum, " ").trim().to_string()
}

/// Round a duration to its 5-second bucket (nearest multiple of 5).
pub fn duration_bucket(duration_seconds: i64) -> i64 {
    ((duration_seconds + 2) / 5) * 5
}

/// Compute the stable 256-bit fingerprint for a track candidate.
///
/// Same inputs yield the same hex digest across processes; duration is
/// fuzzed into 5-second buckets so off-by-a-little durations still collide.
pub fn fingerprint(title: &str, artist: &str, duration_seconds: Option<i64>) -> String {
    let mut input = format!("{}|{}", sanitize(title), sanitize(artist));
    if let Some(duration) = duration_seconds {
        input.push_str(&format!("|{}", duration_bucket(duration)));
    }
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)
}

/// Sanitize a title into a safe filename stem: keep `[A-Za-z0-9 _-]`, trim,
/// truncate to 80 characters.
pub fn sanitize_filename(title: &str) -> String {
    let kept = FILENAME_ALLOWED.replace_all(title, "");
    let trimmed = kept.trim();
    trimmed.chars().take(80).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_brackets() {
        assert_eq!(
            sanitize("Song Name (Official Video) [HD]"),
            "song name"
        );
    }

    #[test]
    fn test_sanitize_stop_words() {
        assert_eq!(sanitize("Track feat Someone official audio"), "track someone");
        assert_eq!(sanitize("Banger High Quality"), "banger");
    }

    #[test]
    fn test_sanitize_keeps_inner_words() {
        // "audiophile" must not lose its "audio" prefix: stop tokens are
        // whole-word only.
        assert_eq!(sanitize("audiophile dreams"), "audiophile dreams");
        assert_eq!(sanitize("lift official"), "lift");
    }

    #[test]
    fn test_sanitize_punctuation_and_whitespace() {
        assert_eq!(sanitize("  Don't   Stop -- Me   Now!  "), "dont stop me now");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let inputs = [
            "Song Name (Official Video) [HD]",
            "Don't Stop Me Now!",
            "feat ft official",
            "",
            "Уже не ascii Ω",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "sanitize not idempotent for {:?}", input);
        }
    }

    #[test]
    fn test_duration_bucket() {
        assert_eq!(duration_bucket(0), 0);
        assert_eq!(duration_bucket(2), 0);
        assert_eq!(duration_bucket(3), 5);
        assert_eq!(duration_bucket(181), 180);
        assert_eq!(duration_bucket(183), 185);
    }

    #[test]
    fn test_duration_bucket_idempotent() {
        for duration in 0..600 {
            let bucket = duration_bucket(duration);
            assert_eq!(duration_bucket(bucket), bucket);
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint("Song", "Artist", Some(180));
        let b = fingerprint("Song", "Artist", Some(180));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_bucketed_duration_collides() {
        // 181s and 179s land in the same 5-second bucket.
        assert_eq!(
            fingerprint("Song", "Artist", Some(181)),
            fingerprint("Song", "Artist", Some(179))
        );
        // 183s rounds to a different bucket.
        assert_ne!(
            fingerprint("Song", "Artist", Some(181)),
            fingerprint("Song", "Artist", Some(183))
        );
    }

    #[test]
    fn test_fingerprint_trivial_variants_collide() {
        assert_eq!(
            fingerprint("Song Name (Official Video)", "The Artist", None),
            fingerprint("song name", "the artist", None)
        );
    }

    #[test]
    fn test_fingerprint_duration_presence_matters() {
        assert_ne!(
            fingerprint("Song", "Artist", None),
            fingerprint("Song", "Artist", Some(0))
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Song: The/Best?"), "My Song TheBest");
        assert_eq!(sanitize_filename("  spaced  "), "spaced");
        let long = "a".repeat(120);
        assert_eq!(sanitize_filename(&long).len(), 80);
    }

    #[test]
    fn test_sanitize_filename_keeps_dash_underscore() {
        assert_eq!(sanitize_filename("a-b_c d"), "a-b_c d");
    }
}
