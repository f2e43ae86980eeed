//! Public URL construction for stored objects.

use crate::StorageKey;

/// Where stored objects can be fetched from by end users.
///
/// A configured public base (usually a CDN or custom domain in front of the
/// bucket) wins; otherwise objects are addressed path-style on the storage
/// endpoint itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicLocation {
    /// `{base}/{key}`
    Base(String),
    /// `{endpoint}/{bucket}/{key}`
    PathStyle { endpoint: String, bucket: String },
}

impl PublicLocation {
    /// Choose between a public base and path-style addressing. Empty or
    /// whitespace-only bases count as unset.
    pub fn new(public_base: Option<&str>, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        match public_base.map(str::trim).filter(|base| !base.is_empty()) {
            Some(base) => Self::Base(base.to_string()),
            None => Self::PathStyle { endpoint: endpoint.into(), bucket: bucket.into() },
        }
    }

    /// ```
    /// use stash_storage::{PublicLocation, StorageKey};
    /// let key = StorageKey::new("cache/weibo/a.jpg").unwrap();
    /// let cdn = PublicLocation::new(Some("https://cdn.example.com//"), "https://s3.example.com", "media");
    /// assert_eq!(cdn.url(&key), "https://cdn.example.com/cache/weibo/a.jpg");
    /// let direct = PublicLocation::new(None, "https://s3.example.com/", "media");
    /// assert_eq!(direct.url(&key), "https://s3.example.com/media/cache/weibo/a.jpg");
    /// ```
    pub fn url(&self, key: &StorageKey) -> String {
        match self {
            Self::Base(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            Self::PathStyle { endpoint, bucket } => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key)
            },
        }
    }
}
