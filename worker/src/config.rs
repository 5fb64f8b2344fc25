//! Worker configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is a valid
//! configuration for a local deployment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::WorkerError;

// ── Defaults ─────────────────────────────────────────────────────────

fn default_origin() -> String {
    String::from("http://localhost:3000")
}

fn default_api_prefix() -> String {
    String::from("/api/")
}

fn default_cache_version() -> String {
    String::from("v1")
}

fn default_precache() -> Vec<String> {
    vec![
        String::from("/"),
        String::from("/index.html"),
        String::from("/offline.html"),
        String::from("/manifest.json"),
    ]
}

fn default_offline_page() -> String {
    String::from("/offline.html")
}

fn default_critical_endpoints() -> Vec<String> {
    vec![
        String::from("/api/v1/dashboard/metrics"),
        String::from("/api/v1/cases"),
        String::from("/api/v1/alerts"),
    ]
}

fn default_search_prefixes() -> Vec<String> {
    vec![String::from("/api/v1/search")]
}

fn default_max_search_entries() -> usize {
    100
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

// ── Retry policy ─────────────────────────────────────────────────────

/// Bounded exponential backoff for queued writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failed attempts after which a record is dead-lettered.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 5_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retries, max)` in milliseconds.
    pub fn backoff_ms(&self, retries: u32) -> u64 {
        let factor = 2u64.checked_pow(retries).unwrap_or(u64::MAX);
        self.base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }

    pub fn backoff(&self, retries: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retries))
    }

    /// Whether a record with `retries` failures must leave the queue.
    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }

    /// Whether the backoff since `last_retry_time` has elapsed at `now`.
    pub fn is_due(&self, retries: u32, last_retry_time: u64, now: u64) -> bool {
        now.saturating_sub(last_retry_time) >= self.backoff_ms(retries)
    }
}

// ── Cache names ──────────────────────────────────────────────────────

/// The cache buckets belonging to one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    /// Precached shell assets.
    pub static_assets: String,
    /// Static assets fetched at runtime.
    pub dynamic: String,
    /// API GET responses.
    pub api: String,
    /// Search responses.
    pub search: String,
}

impl CacheNames {
    pub fn for_version(version: &str) -> Self {
        Self {
            static_assets: format!("static-{}", version),
            dynamic: format!("dynamic-{}", version),
            api: format!("api-{}", version),
            search: format!("search-{}", version),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [
            self.static_assets.as_str(),
            self.dynamic.as_str(),
            self.api.as_str(),
            self.search.as_str(),
        ]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.all().contains(&name)
    }
}

// ── Worker config ────────────────────────────────────────────────────

/// Configuration for a [`SyncWorker`](crate::SyncWorker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Origin of the application; requests to other origins are not intercepted.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Path prefix identifying API requests.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Version tag used to derive cache bucket names.
    #[serde(default = "default_cache_version")]
    pub cache_version: String,
    /// Shell assets fetched into the static cache at install time.
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,
    #[serde(default = "default_offline_page")]
    pub offline_page: String,
    /// API GET paths answered with a synthetic 503 when nothing else works.
    #[serde(default = "default_critical_endpoints")]
    pub critical_endpoints: Vec<String>,
    /// API GET prefixes served network-first from the search cache.
    #[serde(default = "default_search_prefixes")]
    pub search_prefixes: Vec<String>,
    /// Search responses kept per generation; the oldest are evicted first.
    #[serde(default = "default_max_search_entries")]
    pub max_search_entries: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Activate right after a successful install instead of waiting for
    /// `SKIP_WAITING`.
    #[serde(default = "default_true")]
    pub activate_on_install: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            api_prefix: default_api_prefix(),
            cache_version: default_cache_version(),
            precache: default_precache(),
            offline_page: default_offline_page(),
            critical_endpoints: default_critical_endpoints(),
            search_prefixes: default_search_prefixes(),
            max_search_entries: default_max_search_entries(),
            retry: RetryPolicy::default(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            activate_on_install: true,
        }
    }
}

impl WorkerConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, WorkerError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkerError::Config(format!("config file not found: {}", path.display()))
            } else {
                WorkerError::Io(e)
            }
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        self.origin_url()?;
        if !self.api_prefix.starts_with('/') {
            return Err(WorkerError::Config(format!(
                "api_prefix must start with '/': {}",
                self.api_prefix
            )));
        }
        if self.cache_version.is_empty() {
            return Err(WorkerError::Config(String::from("cache_version is empty")));
        }
        if self.max_search_entries == 0 {
            return Err(WorkerError::Config(String::from(
                "max_search_entries must be positive",
            )));
        }
        if self.retry.base_backoff_ms == 0 {
            return Err(WorkerError::Config(String::from(
                "retry.base_backoff_ms must be positive",
            )));
        }
        Ok(())
    }

    /// Parsed application origin.
    pub fn origin_url(&self) -> Result<Url, WorkerError> {
        Url::parse(&self.origin)
            .map_err(|e| WorkerError::Config(format!("invalid origin {}: {}", self.origin, e)))
    }

    pub fn cache_names(&self) -> CacheNames {
        CacheNames::for_version(&self.cache_version)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
