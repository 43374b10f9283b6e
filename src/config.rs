//! Configuration types for batch-transfer

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};

use crate::error::{Error, Result};

/// Largest block the service accepts (4 MiB)
pub const MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Block size used when the configured value is missing or out of range (1 MiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Default ranged-download window (10 MiB)
pub const DEFAULT_DOWNLOAD_WINDOW: u64 = 10 * 1024 * 1024;

/// Connection settings for the batch service
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the batch service, e.g. `https://files.example.com/api`
    pub base_url: String,

    /// Logical resource bearer tokens are requested for
    #[serde(default)]
    pub auth_resource: String,

    /// Per-request transport timeout (default: 300 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Cached tokens expiring within this margin are refreshed (default: 60 seconds)
    #[serde(default = "default_token_refresh_margin", with = "duration_serde")]
    pub token_refresh_margin: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_resource: String::new(),
            request_timeout: default_request_timeout(),
            token_refresh_margin: default_token_refresh_margin(),
        }
    }
}

/// Chunked upload settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Block size in KiB as configured
    ///
    /// Values outside `1..=4096` (or no value at all) fall back to 1 MiB without
    /// raising an error. See [`UploadConfig::block_size_bytes`].
    #[serde(default)]
    pub block_size_kib: Option<i64>,

    /// Maximum block uploads in flight at once per file (default: 4)
    #[serde(default = "default_max_parallel_blocks")]
    pub max_parallel_blocks: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size_kib: None,
            max_parallel_blocks: default_max_parallel_blocks(),
        }
    }
}

impl UploadConfig {
    /// Effective block size in bytes, clamped to `(0, 4 MiB]` with a silent 1 MiB fallback
    pub fn block_size_bytes(&self) -> u64 {
        match self.block_size_kib {
            Some(kib) if kib > 0 && kib as u64 <= MAX_BLOCK_SIZE / 1024 => kib as u64 * 1024,
            Some(kib) => {
                tracing::warn!(
                    block_size_kib = kib,
                    fallback_bytes = DEFAULT_BLOCK_SIZE,
                    "Configured block size out of range, using default"
                );
                DEFAULT_BLOCK_SIZE
            }
            None => DEFAULT_BLOCK_SIZE,
        }
    }

    /// Effective concurrency, never below one
    pub fn parallelism(&self) -> usize {
        self.max_parallel_blocks.max(1)
    }
}

/// Ranged download settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Bytes requested per ranged GET (default: 10 MiB)
    #[serde(default = "default_window_bytes")]
    pub window_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            window_bytes: default_window_bytes(),
        }
    }
}

/// How long and how often to poll a batch's status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollProfile {
    /// Give up once this much time has elapsed
    #[serde(with = "duration_serde")]
    pub cutoff: Duration,

    /// Wait between status calls
    #[serde(with = "duration_serde")]
    pub delay: Duration,
}

impl PollProfile {
    /// Create a new profile
    pub fn new(cutoff: Duration, delay: Duration) -> Self {
        Self { cutoff, delay }
    }
}

impl Default for PollProfile {
    fn default() -> Self {
        Self {
            cutoff: Duration::from_secs(300),
            delay: Duration::from_secs(10),
        }
    }
}

/// Poll profiles, optionally overridden per batch category
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Profile used when a category has no override
    #[serde(default)]
    pub default: PollProfile,

    /// Per-category overrides (e.g. "large-media" batches that take longer to commit)
    #[serde(default)]
    pub categories: HashMap<String, PollProfile>,
}

/// Retry configuration for transient failures
///
/// Only consumed by [`RetryingTransport`](crate::transport::RetryingTransport).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Main configuration for batch-transfer
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Batch service connection settings
    pub service: ServiceConfig,

    /// Chunked upload settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Ranged download settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Status polling profiles
    #[serde(default)]
    pub polling: PollingConfig,

    /// Retry settings for the outer transport decorator
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Config pointing at a service base URL with all other settings defaulted
    pub fn for_service(base_url: impl Into<String>) -> Self {
        Self {
            service: ServiceConfig {
                base_url: base_url.into(),
                ..ServiceConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Check settings that have no sensible fallback
    pub fn validate(&self) -> Result<()> {
        if self.service.base_url.trim().is_empty() {
            return Err(config_error("base URL is required", "service.base_url"));
        }
        if let Err(e) = url::Url::parse(&self.service.base_url) {
            return Err(config_error(
                format!("invalid base URL '{}': {e}", self.service.base_url),
                "service.base_url",
            ));
        }
        if self.download.window_bytes == 0 {
            return Err(config_error(
                "download window must be at least one byte",
                "download.window_bytes",
            ));
        }
        let profiles = std::iter::once(("default", &self.polling.default)).chain(
            self.polling
                .categories
                .iter()
                .map(|(name, profile)| (name.as_str(), profile)),
        );
        for (name, profile) in profiles {
            if profile.delay.is_zero() {
                return Err(config_error(
                    format!("poll delay for '{name}' must be greater than zero"),
                    "polling",
                ));
            }
        }
        Ok(())
    }

    /// Poll profile for a batch category, falling back to the default profile
    pub fn poll_profile(&self, category: Option<&str>) -> PollProfile {
        category
            .and_then(|c| self.polling.categories.get(c))
            .copied()
            .unwrap_or(self.polling.default)
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

// Default value functions
fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_token_refresh_margin() -> Duration {
    Duration::from_secs(60)
}

fn default_max_parallel_blocks() -> usize {
    4
}

fn default_window_bytes() -> u64 {
    DEFAULT_DOWNLOAD_WINDOW
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
