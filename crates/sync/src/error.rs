//! Sync Error Types

use derive_more::{Display, Error};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Every conditional write lost a race with another writer.
    #[display("saved links are busy, gave up after {_0} conflicting writes")]
    SyncContention(#[error(not(source))] u32),
    #[display("storage error")]
    Storage,
    #[display("could not serialize saved links")]
    Serialization,
    /// The stored collection is not a JSON array. It is left as it is.
    #[display("stored saved links are unreadable")]
    Unreadable,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SyncContention(_) | Self::Storage)
    }
}
