//! Time-boxed cache of extraction results.
//!
//! Extracting media from a page is slow (browser-like requests, sometimes
//! several API round trips) so the resulting media list is stored as a small
//! JSON record next to the media itself. Items are usually plain URLs, but
//! any serde type works (live photos are `{cover, video}` pairs):
//!
//! ```json
//! {
//!   "url": "https://weibo.com/1234/AbCdE",
//!   "downloader": "weibo",
//!   "mediaUrls": ["https://cdn.example/cache/weibo/..."],
//!   "cachedAt": "2025-01-01T00:00:00Z",
//!   "expiresAt": "2025-01-31T00:00:00Z"
//! }
//! ```
//!
//! Every failure on this path is a cache miss (reads) or `false` (writes).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stash_config::{Config, DEFAULT_RESULT_CACHE_TTL};
use stash_storage::{StorageKey, StoreHandle, WriteCondition, digest};
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

pub const RESULT_CACHE_PREFIX: &str = "cache/image-downloader/extract";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
pub struct ResultCacheRecord<T = Value> {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub downloader: String,
    #[serde(default)]
    pub media_urls: Vec<T>,
    #[serde(default)]
    pub cached_at: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl<T> ResultCacheRecord<T> {
    /// A record without a readable expiry never expires.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at
            .as_deref()
            .and_then(|expires_at| OffsetDateTime::parse(expires_at, &Rfc3339).ok())
            .is_some_and(|expires_at| now > expires_at)
    }
}

/// Trimmed URL without query string or fragment. Input that does not parse
/// as a URL is only trimmed.
pub fn normalize_url(source_url: &str) -> String {
    let trimmed = source_url.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        },
        Err(_) => trimmed.to_string(),
    }
}

/// Storage key for the record of `extractor` run against `source_url`.
pub fn result_key(source_url: &str, extractor: &str) -> stash_storage::error::Result<StorageKey> {
    let fingerprint = digest(&format!("{extractor}|{}", normalize_url(source_url)));
    StorageKey::new(format!("{RESULT_CACHE_PREFIX}/{fingerprint}.json"))
}

#[derive(Clone)]
pub struct ResultCache {
    store: Option<StoreHandle>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Option<StoreHandle>) -> Self {
        Self { store, ttl: default_ttl() }
    }

    pub fn from_config(config: &Config, store: Option<StoreHandle>) -> Self {
        Self::new(store).with_ttl(config.result_cache_ttl())
    }

    /// A zero `ttl` keeps the thirty day default.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = if ttl.is_zero() { default_ttl() } else { ttl };
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached media items, if a fresh and non-empty record exists and its
    /// items read as `T`.
    pub async fn read<T: DeserializeOwned>(&self, source_url: &str, extractor: &str) -> Option<Vec<T>> {
        let store = self.store.as_ref()?;
        let key = result_key(source_url, extractor).ok()?;
        let object = match store.get(&key).await {
            Ok(Some(object)) => object,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(key = %key, error = ?err, "Could not read cached extraction result");
                return None;
            },
        };
        let record: ResultCacheRecord<T> = match serde_json::from_slice(&object.content) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Ignoring unreadable extraction result");
                return None;
            },
        };
        if record.media_urls.is_empty() {
            return None;
        }
        if record.is_expired(OffsetDateTime::now_utc()) {
            tracing::debug!(key = %key, expires_at = ?record.expires_at, "Cached extraction result expired");
            return None;
        }
        tracing::debug!(key = %key, count = record.media_urls.len(), "Extraction result cache hit");
        Some(record.media_urls)
    }

    /// Store `media_urls`, overwriting any previous record. Returns whether
    /// the record was written.
    pub async fn write<T: Serialize>(&self, source_url: &str, extractor: &str, media_urls: &[T]) -> bool {
        if media_urls.is_empty() {
            return false;
        }
        let Some(store) = &self.store else {
            return false;
        };
        let key = match result_key(source_url, extractor) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = ?err, "Could not derive extraction result key");
                return false;
            },
        };
        let now = OffsetDateTime::now_utc();
        let expires = time::Duration::try_from(self.ttl).ok().and_then(|ttl| now.checked_add(ttl));
        let (Ok(cached_at), Some(Ok(expires_at))) = (now.format(&Rfc3339), expires.map(|at| at.format(&Rfc3339))) else {
            tracing::warn!(key = %key, "Could not format extraction result timestamps");
            return false;
        };
        let record = ResultCacheRecord {
            url: source_url.to_string(),
            downloader: extractor.to_string(),
            media_urls: media_urls.iter().collect::<Vec<_>>(),
            cached_at: Some(cached_at),
            expires_at: Some(expires_at),
        };
        let body = match serde_json::to_vec_pretty(&record) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Could not serialize extraction result");
                return false;
            },
        };
        match store.put(&key, body, Some("application/json"), WriteCondition::None).await {
            Ok(()) => {
                tracing::debug!(key = %key, count = media_urls.len(), "Cached extraction result");
                true
            },
            Err(err) => {
                tracing::warn!(key = %key, error = ?err, "Could not cache extraction result");
                false
            },
        }
    }

    /// Serve from cache, otherwise run `extract` and remember a non-empty
    /// result for next time.
    pub async fn get_or_extract<T, F, Fut, E>(&self, source_url: &str, extractor: &str, extract: F) -> Result<Vec<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        if let Some(cached) = self.read::<T>(source_url, extractor).await {
            return Ok(cached);
        }
        let media_urls = extract().await?;
        if !media_urls.is_empty() {
            self.write(source_url, extractor, media_urls.as_slice()).await;
        }
        Ok(media_urls)
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(DEFAULT_RESULT_CACHE_TTL.unsigned_abs())
}
