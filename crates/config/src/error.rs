//! Configuration Error Types

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A configuration source could not be read or did not deserialize.
    #[display("could not load configuration: {_0}")]
    Load(#[error(not(source))] String),
    /// The merged configuration is unusable.
    #[display("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ErrorKind {
    /// Configuration errors never resolve themselves.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
