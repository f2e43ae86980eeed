//! Outbound resource downloads.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, redirect};
use stash_config::Config;
use stash_storage::DEFAULT_CONTENT_TYPE;
use std::collections::BTreeMap;
use std::time::Duration;

/// Extra request headers (`Referer`, `Cookie`, ...) keyed by header name.
pub type Headers = BTreeMap<String, String>;

/// A downloaded resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Something that can download a resource by URL.
///
/// Any status below 400 counts as success, so a redirect the client is not
/// allowed to follow is returned as-is rather than treated as a failure.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, headers: &Headers) -> Result<Fetched>;
}

/// [`Fetch`] over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_redirects: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::limited(max_redirects))
            .use_rustls_tls()
            .build()
            .or_raise(|| ErrorKind::Fetch("could not build HTTP client".to_string()))?;
        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.fetch_timeout(), config.fetch_max_redirects)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, headers: &Headers) -> Result<Fetched> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.or_raise(|| ErrorKind::Fetch(url.to_string()))?;
        let status = response.status();
        if status.as_u16() >= 400 {
            exn::bail!(ErrorKind::Fetch(format!("{url} (status {status})")));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| infer_content_type(url).to_string());
        let bytes = response.bytes().await.or_raise(|| ErrorKind::Fetch(url.to_string()))?;
        tracing::debug!(url, bytes = bytes.len(), content_type = %content_type, "Fetched resource");
        Ok(Fetched { bytes: bytes.to_vec(), content_type })
    }
}

/// Guess a content type from the extension of a URL or path.
pub fn infer_content_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    let extension = name.rsplit_once('.').map(|(_, extension)| extension.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg" | "jpeg" | "jfif") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("heic") => "image/heic",
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
