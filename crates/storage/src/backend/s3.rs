//! S3-compatible object store.
//!
//! This module provides an [`ObjectStore`] implementation for S3-compatible
//! services including AWS S3, Cloudflare R2, MinIO, Backblaze B2 and others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via configuration; the SDK credential
//! chain is never consulted.
//!
//! # Conditional writes
//!
//! `If-Match` / `If-None-Match: *` are sent as-is. Services that reject them
//! answer `412 Precondition Failed` (or `409 ConditionalRequestConflict` when
//! two conditional writes race inside the service), both of which are
//! reported as [`ErrorKind::Conflict`].

use crate::{
    DEFAULT_CONTENT_TYPE, IMMUTABLE_CACHE_CONTROL, ObjectStore, ObjectVersion, PublicLocation, StorageKey,
    StoredObject, WriteCondition,
    error::{ErrorKind, Result},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
};
use exn::ResultExt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// How a failed S3 call should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    NotFound,
    Denied,
    Conflict,
    Network,
    Other,
}

impl Failure {
    /// Classify using the S3 error code when the service sent one, falling
    /// back to the HTTP status (HEAD responses never carry a body, so their
    /// errors only have a status).
    fn classify(code: Option<&str>, status: Option<u16>) -> Self {
        match (code, status) {
            (Some("NotFound" | "NoSuchKey"), _) | (_, Some(404)) => Self::NotFound,
            (Some("AccessDenied" | "Forbidden"), _) | (_, Some(403)) => Self::Denied,
            (Some("PreconditionFailed" | "ConditionalRequestConflict"), _) | (_, Some(412 | 409)) => {
                Self::Conflict
            },
            _ => Self::Other,
        }
    }

    fn from_sdk<E: ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>, modeled_not_found: bool) -> Self {
        if modeled_not_found {
            return Self::NotFound;
        }
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => Self::Network,
            _ => Self::classify(err.code(), err.raw_response().map(|r| r.status().as_u16())),
        }
    }

    fn into_kind(self, key: &StorageKey, detail: String) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound(key.to_string()),
            Self::Denied => ErrorKind::PermissionDenied(key.to_string()),
            Self::Conflict => ErrorKind::Conflict(key.to_string()),
            Self::Network => ErrorKind::Network(detail),
            Self::Other => ErrorKind::BackendError(detail),
        }
    }
}

/// S3-compatible object store.
///
/// # Examples
///
/// ```no_run
/// use stash_storage::backend::S3Store;
///
/// let store = S3Store::new(
///     "r2",
///     "media",
///     "auto",
///     "https://<account>.r2.cloudflarestorage.com",
///     "access_key_id",
///     "secret_access_key",
/// )
/// .with_public_base(Some("https://cdn.example.com"));
/// ```
#[derive(Debug, Clone)]
pub struct S3Store {
    name: String,
    client: Client,
    bucket: String,
    location: PublicLocation,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Store {
    /// Create a new S3 object store.
    ///
    /// # Arguments
    /// * `name` - A name for this store (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `region` - Provider region (`auto` for R2)
    /// * `endpoint` - Endpoint URL of the S3-compatible service
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Self {
        let bucket = bucket.into();
        let endpoint = endpoint.into();
        let credentials = Credentials::new(key_id, key_secret, None, None, "stash-config");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (R2, MinIO, etc.)
            .force_path_style(true)
            .endpoint_url(endpoint.clone())
            .build();
        let location = PublicLocation::new(None, endpoint, bucket.clone());
        Self::from_client(name, Client::from_conf(config), bucket, location)
    }

    /// Wrap an already configured client (custom SDK config, tests).
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        location: PublicLocation,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            location,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        }
    }

    /// Serve public URLs from `base` (CDN, custom domain) instead of the
    /// endpoint. `None` or an empty string keeps path-style URLs.
    pub fn with_public_base(mut self, base: Option<&str>) -> Self {
        if let PublicLocation::PathStyle { endpoint, bucket } = &self.location {
            self.location = PublicLocation::new(base, endpoint.clone(), bucket.clone());
        }
        self
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // unwrap is safe: semaphore is never closed
        self.rate_limiter.clone().acquire_owned().await.unwrap()
    }

    /// Existence check by downloading the whole object. Only used when the
    /// HEAD probe is forbidden, which some restrictive bucket policies do.
    async fn exists_by_reading(&self, key: &StorageKey) -> bool {
        match self.get(key).await {
            Ok(Some(_)) => {
                tracing::debug!(store = %self.name, key = %key, "Existence confirmed by fallback read");
                true
            },
            Ok(None) => false,
            Err(err) => {
                tracing::error!(store = %self.name, key = %key, error = ?err, "Fallback existence read failed, assuming absent");
                false
            },
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &StorageKey) -> bool {
        let permit = self.acquire_permit().await;
        let result = self.client.head_object().bucket(&self.bucket).key(key.as_str()).send().await;
        drop(permit);
        let err = match result {
            Ok(_) => return true,
            Err(err) => err,
        };
        let modeled = err.as_service_error().is_some_and(|e| e.is_not_found());
        match Failure::from_sdk(&err, modeled) {
            Failure::NotFound => false,
            Failure::Denied => self.exists_by_reading(key).await,
            _ => {
                tracing::error!(store = %self.name, key = %key, error = %DisplayErrorContext(&err), "Existence probe failed, assuming absent");
                false
            },
        }
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<StoredObject>> {
        let _permit = self.acquire_permit().await;
        let response = match self.client.get_object().bucket(&self.bucket).key(key.as_str()).send().await {
            Ok(response) => response,
            Err(err) => {
                let modeled = err.as_service_error().is_some_and(|e| e.is_no_such_key());
                let failure = Failure::from_sdk(&err, modeled);
                if failure == Failure::NotFound {
                    return Ok(None);
                }
                let detail = DisplayErrorContext(&err).to_string();
                return Err(err).or_raise(|| failure.into_kind(key, detail));
            },
        };
        let version = response.e_tag().map(ObjectVersion::new);
        let content = response
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("failed to read body of {key}")))?
            .into_bytes()
            .to_vec();
        Ok(Some(StoredObject { content, version }))
    }

    async fn put(
        &self,
        key: &StorageKey,
        data: Vec<u8>,
        content_type: Option<&str>,
        condition: WriteCondition,
    ) -> Result<()> {
        let _permit = self.acquire_permit().await;
        let bytes = data.len();
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(data))
            .content_type(content_type.unwrap_or(DEFAULT_CONTENT_TYPE))
            .cache_control(IMMUTABLE_CACHE_CONTROL);
        request = match &condition {
            WriteCondition::None => request,
            WriteCondition::IfMatch(version) => request.if_match(version.as_str()),
            WriteCondition::IfAbsent => request.if_none_match("*"),
        };
        match request.send().await {
            Ok(_) => {
                tracing::debug!(store = %self.name, key = %key, bytes, "Stored object");
                Ok(())
            },
            Err(err) => {
                let failure = Failure::from_sdk(&err, false);
                let detail = DisplayErrorContext(&err).to_string();
                Err(err).or_raise(|| failure.into_kind(key, detail))
            },
        }
    }

    fn public_url(&self, key: &StorageKey) -> String {
        self.location.url(key)
    }
}
