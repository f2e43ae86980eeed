//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every failure coming out of an
//! [`ObjectStore`](crate::ObjectStore) is one of these kinds, with the SDK or
//! transport error attached as a child frame.

use derive_more::{Display, Error};

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Object does not exist
    #[display("object not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Access denied by bucket policy or credentials
    #[display("permission denied: {_0}")]
    PermissionDenied(#[error(not(source))] String),
    /// A conditional write was rejected because the object changed (or
    /// appeared) since it was last read. Re-read and try again.
    #[display("conditional write rejected: {_0}")]
    Conflict(#[error(not(source))] String),
    /// Network-related error (connection, timeout, DNS)
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
    /// Key is empty or otherwise unusable
    #[display("invalid key: {_0:?}")]
    InvalidKey(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::BackendError(_) | Self::Conflict(_))
    }

    /// Returns `true` if this is a rejected conditional write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
