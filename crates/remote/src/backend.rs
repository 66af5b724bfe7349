//! Cache backend abstraction
//!
//! Defines the `CacheBackend` trait and its two service variants. The
//! variant is chosen once at startup and injected as `Arc<dyn CacheBackend>`.

use crate::client::contracts::{CacheRestoreReport, GithubCache};
use crate::client::http;
use crate::client::{ArtifactCacheClient, CommitSummary, GithubCachesClient};
use crate::config::{ArtifactCacheConfig, GithubApiConfig, TransferConfig};
use crate::entry::CacheEntry;
use crate::error::{RemoteError, Result};
use crate::version::CacheVersion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Archive to upload under a key
#[derive(Debug, Clone, Copy)]
pub struct SaveRequest<'a> {
    /// Cache key
    pub key: &'a str,
    /// Version fingerprint
    pub version: &'a CacheVersion,
    /// Archive on disk
    pub archive_path: &'a Path,
    /// Time spent creating the archive
    pub archive_time: Duration,
}

/// Timings of a completed restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Restored entry key
    pub key: String,
    /// Version fingerprint
    pub version: CacheVersion,
    /// Ref scope of the entry
    pub scope: String,
    /// Archive size in bytes
    pub size: u64,
    /// Time spent downloading
    pub download_time: Duration,
    /// Time spent extracting
    pub extract_time: Duration,
}

/// Remote cache capability set
///
/// Implementations must be thread-safe (`Send + Sync`); purge issues
/// deletes concurrently.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Whether the service is configured for this job
    fn is_available(&self) -> bool;

    /// Look up the newest entry matching `keys` in order (exact key, then
    /// each key as a prefix) for `version`
    async fn lookup(&self, keys: &[String], version: &CacheVersion)
    -> Result<Option<CacheEntry>>;

    /// Download the archive of a looked-up entry. Returns bytes written.
    async fn restore(&self, entry: &CacheEntry, archive_path: &Path) -> Result<u64>;

    /// Reserve, upload and commit an archive
    async fn save(&self, request: SaveRequest<'_>) -> Result<CommitSummary>;

    /// Entries whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>>;

    /// Delete the entry with exactly this key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Report restore timings; services without reporting ignore it
    async fn report_restore(&self, _report: &RestoreReport) -> Result<()> {
        Ok(())
    }
}

/// Which service variant to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// GitHub Actions cache service
    Actions,
    /// BuildJet cache service
    #[default]
    Buildjet,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Actions => f.write_str("actions"),
            Self::Buildjet => f.write_str("buildjet"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "actions" => Ok(Self::Actions),
            "buildjet" => Ok(Self::Buildjet),
            other => Err(RemoteError::Config(format!(
                "unknown backend '{other}', expected 'actions' or 'buildjet'"
            ))),
        }
    }
}

/// Everything needed to build either backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Selected variant
    pub kind: BackendKind,
    /// Artifact-cache endpoint of the GitHub Actions service
    pub actions: ArtifactCacheConfig,
    /// Artifact-cache endpoint of the BuildJet service
    pub buildjet: ArtifactCacheConfig,
    /// GitHub REST access for listing and deletion
    pub github: GithubApiConfig,
    /// Transfer tuning
    pub transfer: TransferConfig,
}

/// Build the configured backend
pub fn create_backend(config: BackendConfig) -> Result<Arc<dyn CacheBackend>> {
    info!(backend = %config.kind, "Using cache backend");
    match config.kind {
        BackendKind::Actions => Ok(Arc::new(ActionsBackend::new(
            config.actions,
            config.github,
            config.transfer,
        )?)),
        BackendKind::Buildjet => Ok(Arc::new(BuildjetBackend::new(
            config.buildjet,
            config.transfer,
        )?)),
    }
}

async fn download_entry(
    client: &ArtifactCacheClient,
    entry: &CacheEntry,
    archive_path: &Path,
) -> Result<u64> {
    let location = entry
        .archive_location
        .as_deref()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RemoteError::MissingArchiveLocation {
            key: entry.key.clone(),
        })?;
    client.download_archive(location, archive_path).await
}

async fn upload_archive(
    client: &ArtifactCacheClient,
    request: SaveRequest<'_>,
) -> Result<CommitSummary> {
    let cache_size = tokio::fs::metadata(request.archive_path)
        .await
        .map_err(|e| RemoteError::io("stat", request.archive_path, e))?
        .len();
    let reservation = client
        .reserve_cache(request.key, request.version, cache_size)
        .await?;
    client
        .save_cache(
            request.key,
            request.version,
            &reservation,
            request.archive_path,
            request.archive_time,
        )
        .await
}

/// GitHub Actions cache: artifact-cache protocol for entries, GitHub REST
/// for listing and deletion within the current ref
#[derive(Debug, Clone)]
pub struct ActionsBackend {
    artifacts: ArtifactCacheClient,
    github: GithubCachesClient,
}

impl ActionsBackend {
    /// Create the backend
    pub fn new(
        artifacts: ArtifactCacheConfig,
        github: GithubApiConfig,
        transfer: TransferConfig,
    ) -> Result<Self> {
        let retry = transfer.retry.clone();
        Ok(Self {
            artifacts: ArtifactCacheClient::new(artifacts, transfer)?,
            github: GithubCachesClient::new(github, retry)?,
        })
    }
}

#[async_trait]
impl CacheBackend for ActionsBackend {
    fn name(&self) -> &'static str {
        "actions"
    }

    fn is_available(&self) -> bool {
        !self.artifacts.config().base_url.is_empty()
    }

    async fn lookup(
        &self,
        keys: &[String],
        version: &CacheVersion,
    ) -> Result<Option<CacheEntry>> {
        let fallback = keys.first().map_or("", String::as_str);
        Ok(self
            .artifacts
            .get_cache_entry(keys, version)
            .await?
            .map(|entry| entry.into_entry(fallback)))
    }

    async fn restore(&self, entry: &CacheEntry, archive_path: &Path) -> Result<u64> {
        download_entry(&self.artifacts, entry, archive_path).await
    }

    async fn save(&self, request: SaveRequest<'_>) -> Result<CommitSummary> {
        upload_archive(&self.artifacts, request).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        Ok(self
            .github
            .list_by_prefix(prefix)
            .await?
            .into_iter()
            .filter_map(GithubCache::into_entry)
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.github.delete_by_key(key).await
    }
}

/// BuildJet cache: the artifact-cache protocol for everything
#[derive(Debug, Clone)]
pub struct BuildjetBackend {
    artifacts: ArtifactCacheClient,
}

impl BuildjetBackend {
    /// Create the backend
    pub fn new(artifacts: ArtifactCacheConfig, transfer: TransferConfig) -> Result<Self> {
        Ok(Self {
            artifacts: ArtifactCacheClient::new(artifacts, transfer)?,
        })
    }
}

#[async_trait]
impl CacheBackend for BuildjetBackend {
    fn name(&self) -> &'static str {
        "buildjet"
    }

    fn is_available(&self) -> bool {
        !self.artifacts.config().base_url.is_empty()
    }

    async fn lookup(
        &self,
        keys: &[String],
        version: &CacheVersion,
    ) -> Result<Option<CacheEntry>> {
        let fallback = keys.first().map_or("", String::as_str);
        Ok(self
            .artifacts
            .get_cache_entry(keys, version)
            .await?
            .map(|entry| entry.into_entry(fallback)))
    }

    async fn restore(&self, entry: &CacheEntry, archive_path: &Path) -> Result<u64> {
        download_entry(&self.artifacts, entry, archive_path).await
    }

    async fn save(&self, request: SaveRequest<'_>) -> Result<CommitSummary> {
        upload_archive(&self.artifacts, request).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        let list = self.artifacts.list_caches(prefix).await?;
        Ok(list
            .artifact_caches
            .into_iter()
            .filter(|entry| entry.cache_key.is_some())
            .map(|entry| entry.into_entry(prefix))
            .filter(|entry| entry.key.starts_with(prefix))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.artifacts.delete_cache(&[key.to_string()]).await
    }

    async fn report_restore(&self, report: &RestoreReport) -> Result<()> {
        let transfer = self.artifacts.transfer();
        let download_concurrency = if transfer.parallel_download {
            transfer.download_concurrency
        } else {
            1
        };
        let body = CacheRestoreReport {
            cache_key: report.key.clone(),
            cache_version: report.version.to_string(),
            scope: report.scope.clone(),
            size: report.size,
            download_concurrency,
            download_time_ms: http::duration_ms(report.download_time),
            extract_time_ms: http::duration_ms(report.extract_time),
        };
        self.artifacts.report_restore(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("actions".parse::<BackendKind>().unwrap(), BackendKind::Actions);
        assert_eq!(" BuildJet ".parse::<BackendKind>().unwrap(), BackendKind::Buildjet);
        assert!("s3".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::default(), BackendKind::Buildjet);
    }

    #[test]
    fn test_availability_follows_base_url() {
        let available =
            BuildjetBackend::new(ArtifactCacheConfig::new("https://c/", "t"), TransferConfig::default())
                .unwrap();
        let unavailable =
            BuildjetBackend::new(ArtifactCacheConfig::new("", "t"), TransferConfig::default()).unwrap();
        assert!(available.is_available());
        assert!(!unavailable.is_available());
    }
}
