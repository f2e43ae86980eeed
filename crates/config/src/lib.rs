//! Layered configuration for stash.
//!
//! Values are merged from three sources, highest priority last:
//!
//! 1. Built-in defaults
//! 2. A configuration file: an explicit path, or the first of
//!    `config.{toml,yaml,yml,json}` found in the platform config directory
//! 3. Environment variables prefixed with `STASH_` (`STASH_S3_BUCKET`, ...)
//!
//! Storage is optional. When the endpoint, bucket or either credential is
//! missing, [`Config::storage`] returns `None` and callers run in passthrough
//! mode.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "STASH_";
pub const DEFAULT_REGION: &str = "auto";
/// Thirty days.
pub const DEFAULT_RESULT_CACHE_TTL: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

const CONFIG_FILE_STEM: &str = "config";
const CONFIG_FILE_EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// S3-compatible endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`.
    pub s3_endpoint: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    /// Public base URL (CDN or custom domain) in front of the bucket.
    pub s3_public_base: Option<String>,
    /// Skip uploads for objects that already exist.
    pub enable_cache_reuse: bool,
    /// Result cache lifetime in seconds. Non-positive values mean the default.
    pub result_cache_ttl: i64,
    pub fetch_timeout_secs: u64,
    pub fetch_max_redirects: usize,
    /// Downloads in flight per batch.
    pub batch_concurrency: usize,
    pub sync_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s3_endpoint: None,
            s3_bucket: None,
            s3_region: DEFAULT_REGION.to_string(),
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_public_base: None,
            enable_cache_reuse: true,
            result_cache_ttl: DEFAULT_RESULT_CACHE_TTL,
            fetch_timeout_secs: 30,
            fetch_max_redirects: 3,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            sync_max_retries: 10,
        }
    }
}

/// Everything needed to open the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub public_base: Option<String>,
}

impl Config {
    /// Load and validate configuration.
    ///
    /// An explicit `file` must exist; without one, the platform config
    /// directory is searched and a missing file is not an error.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::Load(format!("config file does not exist: {}", path.display())));
                }
                Some(path.to_path_buf())
            },
            None => discover_config_file(),
        };
        if let Some(path) = &file {
            tracing::debug!(path = %path.display(), "loading configuration file");
        }
        Self::from_figment(Self::figment(file.as_deref())?)
    }

    /// Build the layered figment without extracting it.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            let extension = path
                .extension()
                .and_then(|extension| extension.to_str())
                .map(str::to_ascii_lowercase)
                .ok_or_raise(|| ErrorKind::Load(format!("config file has no extension: {}", path.display())))?;
            figment = match extension.as_str() {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "json" => figment.merge(Json::file(path)),
                other => exn::bail!(ErrorKind::Load(format!("unsupported config format: {other}"))),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load("could not extract configuration".to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: &str| ErrorKind::Invalid { field, reason: reason.to_string() };
        if self.batch_concurrency == 0 {
            exn::bail!(invalid("batch_concurrency", "must be at least 1"));
        }
        if self.sync_max_retries == 0 {
            exn::bail!(invalid("sync_max_retries", "must be at least 1"));
        }
        if self.fetch_timeout_secs == 0 {
            exn::bail!(invalid("fetch_timeout_secs", "must be at least 1 second"));
        }
        if self.s3_region.trim().is_empty() {
            exn::bail!(invalid("s3_region", "must not be empty"));
        }
        Ok(())
    }

    /// Storage settings, if storage is fully configured.
    pub fn storage(&self) -> Option<StorageSettings> {
        let present = |value: &Option<String>| value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
        let settings = match (
            present(&self.s3_endpoint),
            present(&self.s3_bucket),
            present(&self.s3_access_key_id),
            present(&self.s3_secret_access_key),
        ) {
            (Some(endpoint), Some(bucket), Some(access_key_id), Some(secret_access_key)) => Some(StorageSettings {
                endpoint,
                bucket,
                region: self.s3_region.clone(),
                access_key_id,
                secret_access_key,
                public_base: present(&self.s3_public_base),
            }),
            _ => None,
        };
        if settings.is_none() {
            tracing::debug!("object storage is not fully configured; running in passthrough mode");
        }
        settings
    }

    /// Result cache lifetime. Falls back to thirty days for non-positive values.
    pub fn result_cache_ttl(&self) -> Duration {
        match u64::try_from(self.result_cache_ttl) {
            Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
            _ => Duration::from_secs(DEFAULT_RESULT_CACHE_TTL as u64),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn discover_config_file() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("", "", "stash")?;
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| dirs.config_dir().join(format!("{CONFIG_FILE_STEM}.{extension}")))
        .find(|candidate| candidate.is_file())
}
