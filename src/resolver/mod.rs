//! Stream resolver: video id -> time-limited direct stream URL.
//!
//! Resolution is expensive and the URLs expire, so results are cached for
//! an hour and concurrent resolutions of the same id are deduplicated
//! through a map of shared futures. When the primary API instance fails,
//! an ordered list of mirror instances is tried before giving up.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::video_platform::{StreamsResponse, VideoApiClient};

/// Cached stream URLs go stale after this long.
pub const STREAM_CACHE_TTL: Duration = Duration::from_secs(3600);

/// How long a caller waits on someone else's in-flight resolution.
pub const PENDING_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

type SharedResolve = Shared<BoxFuture<'static, Option<String>>>;

struct CachedUrl {
    url: String,
    fetched_at: Instant,
}

struct ResolverInner {
    client: reqwest::Client,
    primary: VideoApiClient,
    mirrors: Vec<String>,
    cache: Mutex<HashMap<String, CachedUrl>>,
    pending: Mutex<HashMap<String, SharedResolve>>,
    ttl: Duration,
}

#[derive(Clone)]
pub struct StreamResolver {
    inner: Arc<ResolverInner>,
}

impl StreamResolver {
    pub fn new(client: reqwest::Client, primary: VideoApiClient, mirrors: Vec<String>) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                client,
                primary,
                mirrors,
                cache: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                ttl: STREAM_CACHE_TTL,
            }),
        }
    }

    /// Resolve a video id to a direct stream URL.
    pub async fn resolve(&self, video_id: &str) -> anyhow::Result<String> {
        if let Some(url) = self.cached(video_id) {
            return Ok(url);
        }

        // Join an in-flight resolution if one exists, otherwise start ours.
        let (future, joined) = self.pending_or_start(video_id);
        let result = if joined {
            match timeout(PENDING_JOIN_TIMEOUT, future).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Timed out joining pending resolution for {}", video_id);
                    None
                }
            }
        } else {
            future.await
        };

        result.ok_or_else(|| anyhow::anyhow!("all extraction methods failed"))
    }

    /// Fire-and-forget resolution so the URL is warm when a worker needs
    /// it. Idempotent: a fresh cache entry or in-flight resolution means
    /// no new work.
    pub fn prefetch(&self, video_id: &str) {
        if self.is_cached(video_id) {
            return;
        }
        let (future, joined) = self.pending_or_start(video_id);
        if !joined {
            tokio::spawn(future.map(|_| ()));
        }
    }

    /// Returns true when a non-expired URL is cached for this id.
    pub fn is_cached(&self, video_id: &str) -> bool {
        self.cached(video_id).is_some()
    }

    /// Drop any cached URL for this id, forcing the next resolve to go
    /// upstream. Used when a URL turns out to be expired (HTTP 416).
    pub fn invalidate(&self, video_id: &str) {
        self.inner.cache.lock().unwrap().remove(video_id);
    }

    fn cached(&self, video_id: &str) -> Option<String> {
        let cache = self.inner.cache.lock().unwrap();
        cache.get(video_id).and_then(|entry| {
            (entry.fetched_at.elapsed() < self.inner.ttl).then(|| entry.url.clone())
        })
    }

    /// Return the shared future for this id, creating it if absent.
    /// The bool is true when an existing in-flight future was joined.
    fn pending_or_start(&self, video_id: &str) -> (SharedResolve, bool) {
        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(existing) = pending.get(video_id) {
            return (existing.clone(), true);
        }
        let inner = self.inner.clone();
        let id = video_id.to_string();
        let future = async move { fetch_fresh(inner, id).await }.boxed().shared();
        pending.insert(video_id.to_string(), future.clone());
        (future, false)
    }
}

/// Resolve against the primary instance, then each mirror in order. On
/// success the URL is cached; the pending entry is always cleared.
async fn fetch_fresh(inner: Arc<ResolverInner>, video_id: String) -> Option<String> {
    let url = resolve_upstream(&inner, &video_id).await;

    if let Some(url) = &url {
        inner.cache.lock().unwrap().insert(
            video_id.clone(),
            CachedUrl {
                url: url.clone(),
                fetched_at: Instant::now(),
            },
        );
    }
    inner.pending.lock().unwrap().remove(&video_id);
    url
}

async fn resolve_upstream(inner: &ResolverInner, video_id: &str) -> Option<String> {
    match inner.primary.streams(video_id).await {
        Ok(streams) => {
            if let Some(url) = streams.best_stream_url() {
                debug!("Resolved {} via primary instance", video_id);
                return Some(url.to_string());
            }
            warn!("Primary instance returned no streams for {}", video_id);
        }
        Err(e) => warn!("Primary stream extraction failed for {}: {:#}", video_id, e),
    }

    for instance in &inner.mirrors {
        match mirror_streams(&inner.client, instance, video_id).await {
            Ok(streams) => {
                // Mirrors: audio-only, highest bitrate.
                if let Some(best) = streams.audio_streams.iter().max_by_key(|s| s.bitrate) {
                    debug!("Resolved {} via mirror {}", video_id, instance);
                    return Some(best.url.clone());
                }
            }
            Err(e) => warn!("Mirror {} failed for {}: {:#}", instance, video_id, e),
        }
    }

    None
}

async fn mirror_streams(
    client: &reqwest::Client,
    instance: &str,
    video_id: &str,
) -> anyhow::Result<StreamsResponse> {
    let url = format!("{}/streams/{}", instance.trim_end_matches('/'), video_id);
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("status {}", response.status());
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_client;

    fn resolver() -> StreamResolver {
        let client = build_client();
        let primary = VideoApiClient::new(client.clone(), "http://127.0.0.1:1/api");
        StreamResolver::new(client, primary, vec![])
    }

    fn insert_cache(resolver: &StreamResolver, id: &str, url: &str, age: Duration) {
        resolver.inner.cache.lock().unwrap().insert(
            id.to_string(),
            CachedUrl {
                url: url.to_string(),
                fetched_at: Instant::now() - age,
            },
        );
    }

    #[tokio::test]
    async fn test_cache_hit_returns_without_network() {
        let resolver = resolver();
        insert_cache(&resolver, "v1", "http://cdn.example/a", Duration::ZERO);
        let url = resolver.resolve("v1").await.unwrap();
        assert_eq!(url, "http://cdn.example/a");
    }

    #[test]
    fn test_cache_expiry() {
        let resolver = resolver();
        insert_cache(&resolver, "v1", "u", Duration::ZERO);
        assert!(resolver.is_cached("v1"));

        insert_cache(&resolver, "v2", "u", STREAM_CACHE_TTL + Duration::from_secs(1));
        assert!(!resolver.is_cached("v2"));
    }

    #[test]
    fn test_invalidate() {
        let resolver = resolver();
        insert_cache(&resolver, "v1", "u", Duration::ZERO);
        resolver.invalidate("v1");
        assert!(!resolver.is_cached("v1"));
    }

    #[test]
    fn test_pending_dedup() {
        let resolver = resolver();
        let (_a, joined_a) = resolver.pending_or_start("v1");
        let (_b, joined_b) = resolver.pending_or_start("v1");
        assert!(!joined_a, "first caller starts the resolution");
        assert!(joined_b, "second caller joins the in-flight future");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_yields_error() {
        // Primary points at a closed port and there are no mirrors.
        let resolver = resolver();
        let err = resolver.resolve("v-missing").await.unwrap_err();
        assert_eq!(err.to_string(), "all extraction methods failed");
        // The pending entry is cleared so a retry can start fresh.
        assert!(resolver.inner.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_is_idempotent_on_cache() {
        let resolver = resolver();
        insert_cache(&resolver, "v1", "u", Duration::ZERO);
        resolver.prefetch("v1");
        assert!(resolver.inner.pending.lock().unwrap().is_empty());
    }
}
