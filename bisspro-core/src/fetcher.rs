//! Remote feed fetcher
//!
//! One HTTP GET of a plain-text key feed. The caller owns the cache: a
//! [`FeedCache`] holds the last body and is consulted before going to the
//! network. No retries happen here.

use async_trait::async_trait;
use bisspro_common::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("BissPro/", env!("CARGO_PKG_VERSION"));

/// Remote fetch errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No feed URL configured
    #[error("No feed URL configured")]
    NotConfigured,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// Server answered with a non-success status
    #[error("HTTP error {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid response body: {0}")]
    Body(String),
}

/// Feed settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed URL (empty disables remote operations)
    pub url: String,
    pub timeout_ms: u64,
    /// How long a fetched body is reused (0 disables caching)
    pub cache_ttl_secs: u64,
    /// Line that opens a 4-line block in the feed
    pub ca_marker: String,
    /// Where the cache is persisted between runs
    pub cache_path: Option<PathBuf>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: 15_000,
            cache_ttl_secs: 3_600,
            ca_marker: "BISS".to_string(),
            cache_path: None,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        time::millis_to_duration(self.timeout_ms)
    }
}

/// Plain-text GET
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

/// reqwest-backed [`FeedSource`]
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    http_client: reqwest::Client,
}

impl HttpFeedSource {
    pub fn new() -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn get(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        debug!(%url, ?timeout, "Fetching key feed");

        let response = self
            .http_client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Body(e.to_string())
            }
        })
    }
}

/// Last fetched body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFeed {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// TTL cache for one feed body, optionally persisted as JSON
#[derive(Debug, Clone)]
pub struct FeedCache {
    ttl: chrono::Duration,
    entry: Option<CachedFeed>,
    path: Option<PathBuf>,
}

impl FeedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            entry: None,
            path: None,
        }
    }

    /// Cache persisted at `path`; an existing readable file is loaded
    pub fn with_path(ttl: Duration, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entry = Self::load(&path);
        Self {
            entry,
            path: Some(path),
            ..Self::new(ttl)
        }
    }

    fn load(path: &Path) -> Option<CachedFeed> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable feed cache");
                None
            }
        }
    }

    pub fn entry(&self) -> Option<&CachedFeed> {
        self.entry.as_ref()
    }

    /// Cached body for `url` if younger than the TTL at `now`
    pub fn fresh_at(&self, url: &str, now: DateTime<Utc>) -> Option<&str> {
        let entry = self.entry.as_ref()?;
        let age = now.signed_duration_since(entry.fetched_at);
        (entry.url == url && age >= chrono::Duration::zero() && age < self.ttl)
            .then_some(entry.body.as_str())
    }

    /// Replace the cached entry; the file is written on the blocking pool
    pub async fn store(&mut self, url: &str, body: String, fetched_at: DateTime<Utc>) {
        let entry = CachedFeed {
            url: url.to_string(),
            body,
            fetched_at,
        };

        if let Some(path) = self.path.clone() {
            let persisted = entry.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || persist(&path, &persisted)).await {
                warn!(error = %e, "Feed cache write task failed");
            }
        }
        self.entry = Some(entry);
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

fn persist(path: &Path, entry: &CachedFeed) {
    match serde_json::to_vec(entry) {
        Ok(json) => {
            if let Err(e) = bisspro_common::fs::write_atomic(path, &json) {
                warn!(path = %path.display(), error = %e, "Failed to persist feed cache");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize feed cache"),
    }
}

/// Return the cached body while fresh, otherwise fetch and cache
pub async fn fetch_with_cache(
    source: &dyn FeedSource,
    cache: &mut FeedCache,
    url: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    if url.trim().is_empty() {
        return Err(FetchError::NotConfigured);
    }

    if let Some(body) = cache.fresh_at(url, time::now()) {
        debug!(%url, "Using cached feed");
        return Ok(body.to_string());
    }

    let body = source.get(url, timeout).await?;
    info!(%url, bytes = body.len(), "Fetched key feed");
    cache.store(url, body.clone(), time::now()).await;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSource {
        calls: AtomicUsize,
        result: Result<String, FetchError>,
    }

    #[async_trait]
    impl FeedSource for CountingSource {
        async fn get(&self, _url: &str, _timeout: Duration) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn source(result: Result<String, FetchError>) -> CountingSource {
        CountingSource {
            calls: AtomicUsize::new(0),
            result,
        }
    }

    const URL: &str = "http://feed.example/SoftCam.Key";

    #[tokio::test]
    async fn test_fresh_cache_skips_network() {
        let src = source(Ok("body".to_string()));
        let mut cache = FeedCache::new(Duration::from_secs(60));

        let first = fetch_with_cache(&src, &mut cache, URL, Duration::from_secs(1))
            .await
            .unwrap();
        let second = fetch_with_cache(&src, &mut cache, URL, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first, "body");
        assert_eq!(second, "body");
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_fetches() {
        let src = source(Ok("body".to_string()));
        let mut cache = FeedCache::new(Duration::ZERO);
        for _ in 0..2 {
            fetch_with_cache(&src, &mut cache, URL, Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_error_is_surfaced_and_not_cached() {
        let src = source(Err(FetchError::Timeout));
        let mut cache = FeedCache::new(Duration::from_secs(60));
        let err = fetch_with_cache(&src, &mut cache, URL, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Timeout);
        assert!(cache.entry().is_none());
    }

    #[tokio::test]
    async fn test_empty_url_is_not_configured() {
        let src = source(Ok("body".to_string()));
        let mut cache = FeedCache::new(Duration::from_secs(60));
        let err = fetch_with_cache(&src, &mut cache, " ", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::NotConfigured);
        assert_eq!(src.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_expiry_and_url_mismatch() {
        let mut cache = FeedCache::new(Duration::from_secs(60));
        let t0 = time::now();
        cache.store(URL, "body".to_string(), t0).await;

        assert_eq!(cache.fresh_at(URL, t0 + chrono::Duration::seconds(59)), Some("body"));
        assert_eq!(cache.fresh_at(URL, t0 + chrono::Duration::seconds(60)), None);
        assert_eq!(cache.fresh_at("http://other.example/", t0), None);
    }

    #[tokio::test]
    async fn test_cache_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed_cache.json");
        let t0 = time::now();

        let mut cache = FeedCache::with_path(Duration::from_secs(60), &path);
        cache.store(URL, "persisted".to_string(), t0).await;

        let reloaded = FeedCache::with_path(Duration::from_secs(60), &path);
        assert_eq!(reloaded.fresh_at(URL, t0), Some("persisted"));
    }

    #[tokio::test]
    async fn test_fetch_writes_cache_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed_cache.json");
        let src = source(Ok("from network".to_string()));

        let mut cache = FeedCache::with_path(Duration::from_secs(60), &path);
        fetch_with_cache(&src, &mut cache, URL, Duration::from_secs(1))
            .await
            .unwrap();

        let reloaded = FeedCache::with_path(Duration::from_secs(60), &path);
        assert_eq!(reloaded.entry().map(|e| e.body.as_str()), Some("from network"));
    }

    #[test]
    fn test_corrupt_cache_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed_cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cache = FeedCache::with_path(Duration::from_secs(60), &path);
        assert!(cache.entry().is_none());
    }
}
