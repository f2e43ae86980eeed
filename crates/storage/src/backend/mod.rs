//! Object store trait and implementations.
//!
//! This module defines the [`ObjectStore`] trait, a deliberately small
//! capability over an S3-compatible bucket: existence checks, reads that
//! return a version token, and writes that can be made conditional on that
//! token. Those three primitives are all the saved-link synchronisation
//! needs to stay correct without a lock service.

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "mock")]
pub use self::mock::MockStore;
#[cfg(feature = "s3")]
pub use self::s3::S3Store;
use crate::error::Result;
use crate::{StorageKey, StoredObject, WriteCondition};
use async_trait::async_trait;

/// Unified interface for object storage backends.
///
/// All operations are asynchronous; none of them block a runtime thread.
///
/// # Examples
///
/// ```
/// use stash_storage::{ObjectStore, StorageKey, WriteCondition, error::Result};
///
/// async fn create_once(store: &dyn ObjectStore, key: &StorageKey) -> Result<bool> {
///     if store.exists(key).await {
///         return Ok(false);
///     }
///     store.put(key, b"{}".to_vec(), Some("application/json"), WriteCondition::IfAbsent).await?;
///     Ok(true)
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Check whether an object exists.
    ///
    /// Infallible from the caller's point of view: "not found" is `false`,
    /// and so is any failure the backend cannot resolve.
    ///
    /// # Notes
    /// - If the lightweight probe is denied by access policy, implementations
    ///   fall back to a full read. Success means `true`, not-found means
    ///   `false`, and anything else is logged and reported as `false`.
    /// - Reporting an ambiguous failure as `false` can cause an object that
    ///   already exists to be uploaded again. For immutable, deterministically
    ///   keyed objects that only costs bandwidth.
    async fn exists(&self, key: &StorageKey) -> bool;

    /// Read an object together with its current version token.
    ///
    /// A missing object is `Ok(None)`, not an error.
    async fn get(&self, key: &StorageKey) -> Result<Option<StoredObject>>;

    /// Write an object.
    ///
    /// Returns [`Conflict`](crate::error::ErrorKind::Conflict) when `condition`
    /// is not met: for [`WriteCondition::IfMatch`] the current version differs
    /// (or the object is gone); for [`WriteCondition::IfAbsent`] something
    /// already exists at `key`.
    ///
    /// # Notes
    /// - `content_type` defaults to [`DEFAULT_CONTENT_TYPE`](crate::DEFAULT_CONTENT_TYPE).
    /// - Implementations mark objects as publicly cacheable and immutable
    ///   ([`IMMUTABLE_CACHE_CONTROL`](crate::IMMUTABLE_CACHE_CONTROL)).
    async fn put(
        &self,
        key: &StorageKey,
        data: Vec<u8>,
        content_type: Option<&str>,
        condition: WriteCondition,
    ) -> Result<()>;

    /// URL at which end users can fetch the object stored under `key`.
    fn public_url(&self, key: &StorageKey) -> String;
}
