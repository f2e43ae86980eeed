//! Mirror individual resources into object storage.

use crate::error::{ErrorKind, Result};
use crate::fetch::{Fetch, Fetched, Headers, HttpFetcher};
use exn::{OptionExt, ResultExt};
use stash_config::{Config, DEFAULT_BATCH_CONCURRENCY};
use stash_storage::{StorageKey, StoreHandle, WriteCondition, derive_key};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Copies remote media (or finished local files) into object storage under
/// deterministic keys and hands back the public URL.
///
/// Without a store every URL passes through untouched, so callers never have
/// to branch on whether storage is configured.
#[derive(Clone)]
pub struct ResourceCache {
    store: Option<StoreHandle>,
    fetcher: Arc<dyn Fetch>,
    reuse: bool,
    concurrency: usize,
}

impl ResourceCache {
    /// Cache-reuse is enabled by default.
    pub fn new(store: Option<StoreHandle>, fetcher: Arc<dyn Fetch>) -> Self {
        Self { store, fetcher, reuse: true, concurrency: DEFAULT_BATCH_CONCURRENCY }
    }

    /// HTTP fetcher, cache-reuse and batch concurrency taken from `config`.
    pub fn from_config(config: &Config, store: Option<StoreHandle>) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(config)?;
        Ok(Self::new(store, Arc::new(fetcher))
            .with_cache_reuse(config.enable_cache_reuse)
            .with_batch_concurrency(config.batch_concurrency))
    }

    /// When disabled, every call downloads and uploads again.
    pub fn with_cache_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Downloads in flight for [`cache_many`](Self::cache_many), at least one.
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn batch_concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn store(&self) -> Option<&StoreHandle> {
        self.store.as_ref()
    }

    /// [`crate::cache_many`] with this cache's batch concurrency.
    pub async fn cache_many<I, S>(
        &self,
        urls: I,
        namespace: &str,
        headers: &Headers,
        scope: Option<&str>,
    ) -> HashMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        crate::batch::cache_many(self, urls, namespace, headers, self.concurrency, scope).await
    }

    /// Mirror `url` and return its public URL.
    ///
    /// Returns `url` unchanged, without any network access, when no store is
    /// configured.
    pub async fn cache_from_url(
        &self,
        url: &str,
        namespace: &str,
        headers: &Headers,
        scope: Option<&str>,
    ) -> Result<String> {
        let Some(store) = &self.store else {
            tracing::debug!(url, "No object store configured, passing URL through");
            return Ok(url.to_string());
        };
        let key = derive_key(url, namespace, scope, false);
        self.store_unless_cached(store, &key, || self.fetcher.fetch(url, headers))
            .await
            .or_raise(|| ErrorKind::CacheOperationFailed(url.to_string()))?;
        Ok(store.public_url(&key))
    }

    /// Upload a file produced locally (for example a muxed video).
    ///
    /// The key is derived from the path the same way it is from a URL.
    pub async fn cache_from_local_file(
        &self,
        path: &Path,
        content_type: &str,
        namespace: &str,
        scope: Option<&str>,
        preserve_name: bool,
    ) -> Result<String> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            exn::bail!(ErrorKind::LocalFileNotFound(path.to_path_buf()));
        }
        let store = self.store.as_ref().ok_or_raise(|| ErrorKind::StorageNotConfigured)?;
        let key = derive_key(&path.to_string_lossy(), namespace, scope, preserve_name);
        let load = || async {
            let bytes = tokio::fs::read(path).await.or_raise(|| ErrorKind::Io)?;
            Ok::<_, crate::error::Error>(Fetched { bytes, content_type: content_type.to_string() })
        };
        self.store_unless_cached(store, &key, load)
            .await
            .or_raise(|| ErrorKind::CacheOperationFailed(path.display().to_string()))?;
        Ok(store.public_url(&key))
    }

    /// Public URL of an already mirrored resource, if there is one.
    ///
    /// Only probes for existence; nothing is downloaded or uploaded.
    pub async fn lookup_cached(
        &self,
        name: &str,
        namespace: &str,
        scope: Option<&str>,
        preserve_name: bool,
    ) -> Option<String> {
        let store = self.store.as_ref()?;
        let key = derive_key(name, namespace, scope, preserve_name);
        if store.exists(&key).await {
            tracing::debug!(store = store.name(), key = %key, "Cache hit");
            Some(store.public_url(&key))
        } else {
            None
        }
    }

    async fn store_unless_cached<F, Fut>(&self, store: &StoreHandle, key: &StorageKey, load: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched>>,
    {
        if self.reuse && store.exists(key).await {
            tracing::debug!(store = store.name(), key = %key, "Already cached, skipping upload");
            return Ok(());
        }
        let Fetched { bytes, content_type } = load().await?;
        let size = bytes.len();
        store
            .put(key, bytes, Some(&content_type), WriteCondition::None)
            .await
            .or_raise(|| ErrorKind::Storage)?;
        tracing::debug!(store = store.name(), key = %key, bytes = size, content_type = %content_type, "Uploaded");
        Ok(())
    }
}
