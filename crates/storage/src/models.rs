//! Storage models.
//!
//! These types describe what comes back from a read and what a write is
//! allowed to assume about the object it replaces.

use std::fmt;

/// Default content type when neither the caller nor the source supplies one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
/// Cache-Control sent with every write. Mirrored objects never change once
/// written, so downstream CDNs may keep them forever.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public,max-age=31536000,immutable";

/// Opaque revision token (an S3 ETag) for the current content of an object.
///
/// Only ever compared for equality, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    pub fn new(etag: impl Into<String>) -> Self {
        Self(etag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object contents returned by [`ObjectStore::get`](crate::ObjectStore::get).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Raw object body
    pub content: Vec<u8>,
    /// Version token of the body that was read. Some S3-compatible services
    /// omit the ETag; a missing token means conditional updates against this
    /// read are impossible.
    pub version: Option<ObjectVersion>,
}

impl StoredObject {
    pub fn new(content: impl Into<Vec<u8>>, version: Option<ObjectVersion>) -> Self {
        Self { content: content.into(), version }
    }
}

/// Precondition attached to a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WriteCondition {
    /// Overwrite unconditionally.
    #[default]
    None,
    /// Only replace the object if its current version is exactly this one
    /// (`If-Match`).
    IfMatch(ObjectVersion),
    /// Only create the object if nothing exists at the key yet
    /// (`If-None-Match: *`).
    IfAbsent,
}

impl WriteCondition {
    pub fn is_conditional(&self) -> bool {
        !matches!(self, Self::None)
    }
}
