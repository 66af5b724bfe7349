//! Configuration types for the remote cache clients

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default artifact-cache endpoint of the BuildJet service
pub const DEFAULT_BUILDJET_CACHE_URL: &str = "https://cache-api.buildjet.com/";

/// Default GitHub REST API endpoint
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Connection settings for an artifact-cache protocol endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactCacheConfig {
    /// Service base URL; resources live under `<base>_apis/artifactcache/`
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub token: String,

    /// User agent reported to the service
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra headers attached to every JSON request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ArtifactCacheConfig {
    /// Create a config for the given endpoint and token
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            user_agent: default_user_agent(),
            headers: BTreeMap::new(),
        }
    }

    /// Add a header sent with every JSON request
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Build the full URL for an artifact-cache resource
    pub fn resource_url(&self, resource: &str) -> String {
        let base = if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        };
        format!("{base}_apis/artifactcache/{resource}")
    }
}

/// Connection settings for the GitHub REST cache-management API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GithubApiConfig {
    /// API base URL (e.g. `https://api.github.com`)
    #[serde(default = "default_github_api_url")]
    pub api_url: String,

    /// Repository in `owner/name` form
    pub repository: String,

    /// Git ref the caches are scoped to (e.g. `refs/heads/main`)
    pub git_ref: String,

    /// Token with `actions: write` permission
    pub token: String,

    /// User agent reported to the API
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl GithubApiConfig {
    /// Create a config for a repository and ref
    pub fn new(
        repository: impl Into<String>,
        git_ref: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            api_url: default_github_api_url(),
            repository: repository.into(),
            git_ref: git_ref.into(),
            token: token.into(),
            user_agent: default_user_agent(),
        }
    }

    /// Override the API base URL
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// URL of the repository's cache collection
    pub fn caches_url(&self) -> String {
        format!(
            "{}/repos/{}/actions/caches",
            self.api_url.trim_end_matches('/'),
            self.repository
        )
    }
}

/// Archive transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// Number of chunk URLs requested when reserving an upload
    #[serde(default = "default_upload_chunks")]
    pub upload_chunks: usize,

    /// Target chunk size in bytes; when set it decides the chunk count
    #[serde(default)]
    pub upload_chunk_size: Option<u64>,

    /// Number of concurrent ranged connections for downloads
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Use multi-connection ranged downloads
    #[serde(default = "default_true")]
    pub parallel_download: bool,

    /// Abort a download when no bytes arrive for this many milliseconds
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Interval between progress lines in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Retry configuration for chunk and range requests
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_chunks: default_upload_chunks(),
            upload_chunk_size: None,
            download_concurrency: default_download_concurrency(),
            parallel_download: true,
            socket_timeout_ms: default_socket_timeout_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Idle timeout as a duration
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Number of chunks to reserve for an archive of `cache_size` bytes
    pub fn chunk_count(&self, cache_size: u64) -> usize {
        match self.upload_chunk_size {
            Some(chunk_size) if chunk_size > 0 => {
                usize::try_from(cache_size.div_ceil(chunk_size).max(1)).unwrap_or(usize::MAX)
            }
            _ => self.upload_chunks.max(1),
        }
    }

    /// Progress interval as a duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// Default value functions
fn default_user_agent() -> String {
    format!("cachenix/{}", env!("CARGO_PKG_VERSION"))
}

fn default_github_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_upload_chunks() -> usize {
    4
}

fn default_download_concurrency() -> usize {
    8
}

fn default_socket_timeout_ms() -> u64 {
    30_000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
