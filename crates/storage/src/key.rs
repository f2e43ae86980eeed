//! Deterministic storage key derivation.
//!
//! Every mirrored resource lives at `cache/<namespace>/[<scope>/]<name>.<ext>`.
//! The same `(url, namespace, scope, preserve_name)` always produces the same
//! key, in any process, so an existence check is enough to know whether a
//! resource has already been mirrored.

use crate::error::{ErrorKind, Result};
use md5::{Digest, Md5};
use std::fmt;

/// Root prefix shared by every object this workspace writes.
pub const KEY_ROOT: &str = "cache";
/// Extension used when the source URL has none.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// A validated object key.
///
/// Keys are relative (no leading slash), non-empty, and contain no empty,
/// `.` or `..` segments or null bytes. Keys produced by [`derive_key`] always
/// satisfy these rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    /// Validate a fixed key (result-cache entries, the saved-links object).
    ///
    /// ```
    /// use stash_storage::StorageKey;
    /// assert!(StorageKey::new("cache/image-downloader/saved-links.json").is_ok());
    /// assert!(StorageKey::new("").is_err());
    /// assert!(StorageKey::new("cache/../secrets").is_err());
    /// assert!(StorageKey::new("/cache/a.json").is_err());
    /// ```
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let invalid = key.is_empty()
            || key.starts_with('/')
            || key.contains('\0')
            || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
        if invalid {
            exn::bail!(ErrorKind::InvalidKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase hex MD5 of `input`.
///
/// Not used for anything security related: it only needs to be stable and
/// spread distinct URLs across distinct names.
pub fn digest(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Derive the storage key for a remote resource.
///
/// - The query string is dropped before anything else, so signed/tokenised
///   URLs for the same file map to the same key.
/// - `scope` (or `preserve_name`) keeps the original basename, which is
///   readable but only unique within the scope; otherwise the name is the MD5
///   of the query-less URL.
/// - The extension comes from the last path segment, defaulting to `jpg`.
///
/// Never fails: a malformed URL is simply treated as an opaque string. A
/// namespace that is not a single usable path segment is replaced by its
/// MD5, an unusable scope is ignored, and an unusable basename falls back to
/// the hashed name.
///
/// ```
/// use stash_storage::derive_key;
/// let key = derive_key("https://img.example/a/b/photo.png?token=1", "weibo", Some("4711"), false);
/// assert_eq!(key.as_str(), "cache/weibo/4711/photo.png");
/// ```
pub fn derive_key(url: &str, namespace: &str, scope: Option<&str>, preserve_name: bool) -> StorageKey {
    let clean = strip_query(url);
    let basename = basename(clean);
    let extension = extension(basename).filter(|ext| is_segment(ext)).unwrap_or(DEFAULT_EXTENSION);
    let namespace = match is_segment(namespace) {
        true => namespace.to_string(),
        false => digest(namespace),
    };
    let scope = scope.filter(|scope| is_segment(scope));

    let readable = match scope.is_some() || preserve_name {
        true => {
            let stem = basename.rfind('.').map_or(basename, |dot| &basename[..dot]);
            Some(stem).filter(|stem| is_segment(stem))
        },
        false => None,
    };
    let name = readable.map_or_else(|| digest(clean), str::to_string);

    let key = match scope {
        Some(scope) => format!("{KEY_ROOT}/{namespace}/{scope}/{name}.{extension}"),
        None => format!("{KEY_ROOT}/{namespace}/{name}.{extension}"),
    };
    StorageKey(key)
}

/// Whether `value` can stand alone as one key segment.
fn is_segment(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\0'])
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(head, _)| head)
}

/// Last `/`-separated segment, ignoring trailing slashes.
fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit_once('/').map_or(trimmed, |(_, last)| last)
}

/// Text after the last dot, unless the dot leads the name (`.hidden`) or
/// trails it (`name.`).
fn extension(basename: &str) -> Option<&str> {
    match basename.rfind('.') {
        Some(0) | None => None,
        Some(dot) => Some(&basename[dot + 1..]).filter(|ext| !ext.is_empty()),
    }
}
