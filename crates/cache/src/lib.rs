//! Mirror scraped media into object storage.
//!
//! Three caches sit on top of an [`ObjectStore`](stash_storage::ObjectStore):
//!
//! - [`ResourceCache`] copies one remote resource (or a finished local file)
//!   into the bucket under a deterministic key and returns its public URL.
//! - [`cache_many`] does the same for a whole batch with bounded concurrency,
//!   falling back to the source URL for anything that fails.
//! - [`ResultCache`] remembers which media an extractor found for a page, for
//!   a limited time.
//!
//! Storage is optional. Without a store, resource URLs pass through untouched
//! and the result cache always misses.

mod batch;
pub mod error;
mod fetch;
mod resource;
mod result;
#[cfg(test)]
mod testing;

pub use crate::batch::cache_many;
pub use crate::fetch::{Fetch, Fetched, Headers, HttpFetcher, infer_content_type};
pub use crate::resource::ResourceCache;
pub use crate::result::{RESULT_CACHE_PREFIX, ResultCache, ResultCacheRecord, normalize_url, result_key};

/// Open the S3 store described by `config`, if storage is fully configured.
#[cfg(feature = "s3")]
pub fn connect(config: &stash_config::Config) -> Option<stash_storage::StoreHandle> {
    use stash_storage::backend::S3Store;
    use std::sync::Arc;

    let settings = config.storage()?;
    tracing::debug!(endpoint = %settings.endpoint, bucket = %settings.bucket, "Connecting object store");
    let store = S3Store::new(
        "s3",
        settings.bucket,
        settings.region,
        settings.endpoint,
        settings.access_key_id,
        settings.secret_access_key,
    )
    .with_public_base(settings.public_base.as_deref());
    Some(Arc::new(store))
}
