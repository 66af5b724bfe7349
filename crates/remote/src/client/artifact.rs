//! Artifact-cache protocol client (`_apis/artifactcache`)

use crate::client::contracts::{
    ArtifactCacheEntry, ArtifactCacheList, CacheRestoreReport, CommitCacheRequest,
    ReserveCacheRequest, ReserveCacheResponse, UploadPart,
};
use crate::client::http::{self, ServiceHeaders};
use crate::config::{ArtifactCacheConfig, TransferConfig};
use crate::error::{RemoteError, Result};
use crate::retry::retry_with_backoff;
use crate::transfer::{download_multi, download_single, upload_chunks};
use crate::version::CacheVersion;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// `Accept` header required by the protocol
pub const ARTIFACT_CACHE_ACCEPT: &str = "application/json;api-version=6.0-preview.1";

/// Summary of a committed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Archive size in bytes
    pub cache_size: u64,
    /// Chunks in part order
    pub parts: Vec<UploadPart>,
    /// Time spent uploading
    pub upload_time: Duration,
}

/// Client for one artifact-cache endpoint
#[derive(Debug, Clone)]
pub struct ArtifactCacheClient {
    http: Client,
    headers: ServiceHeaders,
    config: ArtifactCacheConfig,
    transfer: TransferConfig,
}

impl ArtifactCacheClient {
    /// Create a client for the configured endpoint
    pub fn new(config: ArtifactCacheConfig, transfer: TransferConfig) -> Result<Self> {
        let http = http::build_client(&config.user_agent)?;
        let headers = ServiceHeaders::new(&config.token, ARTIFACT_CACHE_ACCEPT, &config.headers);
        Ok(Self {
            http,
            headers,
            config,
            transfer,
        })
    }

    /// Endpoint configuration
    pub fn config(&self) -> &ArtifactCacheConfig {
        &self.config
    }

    /// Transfer configuration
    pub fn transfer(&self) -> &TransferConfig {
        &self.transfer
    }

    fn url(&self, resource: &str) -> String {
        let url = self.config.resource_url(resource);
        debug!(url = %url, "Resource Url");
        url
    }

    /// Look up the newest entry matching `keys` for `version`.
    ///
    /// The service tries the keys in order: an exact key match first, then
    /// each key as a prefix. `204 No Content` is a miss.
    #[instrument(skip(self), fields(version = %version))]
    pub async fn get_cache_entry(
        &self,
        keys: &[String],
        version: &CacheVersion,
    ) -> Result<Option<ArtifactCacheEntry>> {
        let joined = keys.join(",");
        let url = self.url("cache");

        let response = retry_with_backoff(&self.transfer.retry, "getCacheEntry", || async {
            let request = self
                .headers
                .apply(self.http.get(&url))
                .query(&[("keys", joined.as_str()), ("version", version.as_str())]);
            let response = http::send("getCacheEntry", request).await?;
            http::ensure_success("getCacheEntry", response).await
        })
        .await?;

        if response.status() == StatusCode::NO_CONTENT {
            if tracing::enabled!(tracing::Level::DEBUG)
                && let Some(primary) = keys.first()
            {
                self.log_similar_caches(primary, version).await;
            }
            return Ok(None);
        }

        let entry: ArtifactCacheEntry = http::read_json("getCacheEntry", response).await?;
        if entry.archive_location.as_deref().is_none_or(str::is_empty) {
            return Err(RemoteError::MissingArchiveLocation {
                key: entry.cache_key.unwrap_or(joined),
            });
        }

        debug!(
            key = ?entry.cache_key,
            scope = ?entry.scope,
            created = ?entry.creation_time,
            "Cache Result"
        );
        Ok(Some(entry))
    }

    /// List every entry stored under `key` (all versions and scopes)
    #[instrument(skip(self))]
    pub async fn list_caches(&self, key: &str) -> Result<ArtifactCacheList> {
        let url = self.url("caches");
        let response = retry_with_backoff(&self.transfer.retry, "listCache", || async {
            let request = self.headers.apply(self.http.get(&url)).query(&[("key", key)]);
            let response = http::send("listCache", request).await?;
            http::ensure_success("listCache", response).await
        })
        .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(ArtifactCacheList::default());
        }
        http::read_json("listCache", response).await
    }

    async fn log_similar_caches(&self, key: &str, version: &CacheVersion) {
        let list = match self.list_caches(key).await {
            Ok(list) => list,
            Err(e) => {
                debug!(error = %e, "Could not list caches for diagnostics");
                return;
            }
        };
        if list.total_count == 0 {
            return;
        }

        debug!(
            key = %key,
            version = %version,
            "No matching cache found for this key and version; caches with a similar key exist with a different version or scope"
        );
        for entry in &list.artifact_caches {
            debug!(
                key = ?entry.cache_key,
                version = ?entry.cache_version,
                scope = ?entry.scope,
                created = ?entry.creation_time,
                "Other cache with similar key"
            );
        }
    }

    /// Reserve an upload session for `key`.
    ///
    /// A `409 Conflict` means another job is saving the same key and is
    /// reported as [`RemoteError::ReservationConflict`].
    #[instrument(skip(self), fields(version = %version))]
    pub async fn reserve_cache(
        &self,
        key: &str,
        version: &CacheVersion,
        cache_size: u64,
    ) -> Result<ReserveCacheResponse> {
        let body = ReserveCacheRequest {
            key: key.to_string(),
            version: version.to_string(),
            cache_size,
            chunks: self.transfer.chunk_count(cache_size),
        };
        let url = self.url("caches");

        let response = retry_with_backoff(&self.transfer.retry, "reserveCache", || async {
            let request = self.headers.apply(self.http.post(&url)).json(&body);
            let response = http::send("reserveCache", request).await?;
            if response.status() == StatusCode::CONFLICT {
                return Err(RemoteError::ReservationConflict {
                    key: key.to_string(),
                });
            }
            http::ensure_success("reserveCache", response).await
        })
        .await?;

        http::read_json("reserveCache", response).await
    }

    /// Upload the archive into a reserved session and commit it
    #[instrument(skip(self, reservation), fields(upload_id = %reservation.upload_id, path = %archive_path.display()))]
    pub async fn save_cache(
        &self,
        key: &str,
        version: &CacheVersion,
        reservation: &ReserveCacheResponse,
        archive_path: &Path,
        archive_time: Duration,
    ) -> Result<CommitSummary> {
        debug!("Upload cache");
        let started = Instant::now();
        let parts = upload_chunks(
            &self.http,
            &self.transfer.retry,
            &reservation.urls,
            archive_path,
        )
        .await?;
        let upload_time = started.elapsed();

        let cache_size = tokio::fs::metadata(archive_path)
            .await
            .map_err(|e| RemoteError::io("stat", archive_path, e))?
            .len();
        info!(
            cache_size,
            "Cache Size: ~{} MB ({} B)",
            cache_size.div_ceil(1024 * 1024),
            cache_size
        );

        let body = CommitCacheRequest {
            key: key.to_string(),
            version: version.to_string(),
            upload_id: reservation.upload_id.clone(),
            cache_size,
            parts: parts.clone(),
            upload_time_ms: http::duration_ms(upload_time),
            archive_time_ms: http::duration_ms(archive_time),
        };
        let url = self.url("commitCache");

        debug!("Committing cache");
        retry_with_backoff(&self.transfer.retry, "commitCache", || async {
            let request = self.headers.apply(self.http.post(&url)).json(&body);
            let response = http::send("commitCache", request).await?;
            http::ensure_success("commitCache", response).await
        })
        .await?;

        info!(key = %key, "Cache saved successfully");
        Ok(CommitSummary {
            cache_size,
            parts,
            upload_time,
        })
    }

    /// Delete every entry with one of `keys`
    #[instrument(skip(self))]
    pub async fn delete_cache(&self, keys: &[String]) -> Result<()> {
        let joined = keys.join(",");
        let url = self.url("cache");
        retry_with_backoff(&self.transfer.retry, "deleteCache", || async {
            let request = self
                .headers
                .apply(self.http.delete(&url))
                .query(&[("keys", joined.as_str())]);
            let response = http::send("deleteCache", request).await?;
            http::ensure_success("deleteCache", response).await
        })
        .await?;
        Ok(())
    }

    /// Report restore timings to the service
    pub async fn report_restore(&self, report: &CacheRestoreReport) -> Result<()> {
        let url = self.url("cacheRestoreReport");
        retry_with_backoff(&self.transfer.retry, "cacheRestoreReport", || async {
            let request = self.headers.apply(self.http.post(&url)).json(report);
            let response = http::send("cacheRestoreReport", request).await?;
            http::ensure_success("cacheRestoreReport", response).await
        })
        .await?;
        Ok(())
    }

    /// Download an archive from its (pre-signed) location.
    ///
    /// Uses ranged connections unless parallel download is disabled, and
    /// falls back to one connection when the server does not honour
    /// range requests.
    #[instrument(skip(self, archive_location), fields(path = %archive_path.display()))]
    pub async fn download_archive(&self, archive_location: &str, archive_path: &Path) -> Result<u64> {
        if !self.transfer.parallel_download {
            return download_single(&self.http, &self.transfer, archive_location, archive_path)
                .await;
        }

        match download_multi(&self.http, &self.transfer, archive_location, archive_path).await {
            Err(RemoteError::RangeNotSupported) => {
                warn!("Range requests not supported by the archive server, downloading over a single connection");
                download_single(&self.http, &self.transfer, archive_location, archive_path).await
            }
            other => other,
        }
    }
}
