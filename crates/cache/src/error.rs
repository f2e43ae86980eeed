//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Storage and transport failures are
//! kept as child frames underneath these kinds.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// An operation that cannot fall back to the source URL was attempted
    /// without object storage.
    #[display("object storage is not configured")]
    StorageNotConfigured,
    #[display("local file not found: {}", _0.display())]
    LocalFileNotFound(#[error(not(source))] PathBuf),
    /// Mirroring a resource failed; the child frame says why.
    #[display("could not cache resource: {_0}")]
    CacheOperationFailed(#[error(not(source))] String),
    #[display("could not fetch {_0}")]
    Fetch(#[error(not(source))] String),
    #[display("i/o error")]
    Io,
    #[display("storage error")]
    Storage,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheOperationFailed(_) | Self::Fetch(_) | Self::Storage)
    }
}
