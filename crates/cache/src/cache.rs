//! The cache as one workflow sees it: a backend, an archiver and the
//! version fingerprint of the configured paths

use crate::archive::Archiver;
use crate::config::{CacheConfig, resolve_cached_path};
use crate::error::{Error, Result};
use cachenix_remote::{
    CacheBackend, CacheEntry, CacheVersion, CommitSummary, RestoreReport, SaveRequest,
};
use cachenix_store::{Reconciler, StoreDatabase};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Archive transfers for one set of cached paths
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    archiver: Arc<dyn Archiver>,
    version: CacheVersion,
    archive_paths: Vec<PathBuf>,
    scratch_dir: PathBuf,
    reconciler: Option<Reconciler>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.backend.name())
            .field("version", &self.version)
            .field("archive_paths", &self.archive_paths)
            .field("scratch_dir", &self.scratch_dir)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Build the cache for `config`; `home` expands `~` in paths and
    /// relative paths are resolved against the configured working directory
    pub fn new(
        config: &CacheConfig,
        backend: Arc<dyn CacheBackend>,
        archiver: Arc<dyn Archiver>,
        home: Option<&Path>,
    ) -> Result<Self> {
        config.validate()?;

        let version = CacheVersion::compute(
            &config.paths,
            Some(archiver.compression_method()),
            config.cross_os_archive,
        );

        let resolve = |p: &str| resolve_cached_path(p, home, &config.working_dir);
        let excluded: Vec<PathBuf> = config
            .paths
            .iter()
            .filter_map(|p| p.strip_prefix('!'))
            .map(resolve)
            .collect();
        let archive_paths: Vec<PathBuf> = config
            .paths
            .iter()
            .filter(|p| !p.starts_with('!'))
            .map(|p| resolve(p))
            .filter(|p| !excluded.contains(p))
            .collect();

        let reconciler = config.merge_store_database.then(|| {
            Reconciler::new(
                StoreDatabase::new(&config.store_database),
                config.scratch_dir.join("store-db"),
            )
        });

        debug!(version = %version, paths = ?archive_paths, "Configured cache");
        Ok(Self {
            backend,
            archiver,
            version,
            archive_paths,
            scratch_dir: config.scratch_dir.clone(),
            reconciler,
        })
    }

    /// Version fingerprint of the configured paths
    #[must_use]
    pub const fn version(&self) -> &CacheVersion {
        &self.version
    }

    /// The remote backend
    #[must_use]
    pub fn backend(&self) -> &dyn CacheBackend {
        self.backend.as_ref()
    }

    /// Expanded paths that go into an archive
    #[must_use]
    pub fn archive_paths(&self) -> &[PathBuf] {
        &self.archive_paths
    }

    /// Whether the backend is configured
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Look up the newest entry for `keys` (exact, then as prefixes, in order)
    pub async fn lookup(&self, keys: &[String]) -> Result<Option<CacheEntry>> {
        Ok(self.backend.lookup(keys, &self.version).await?)
    }

    /// Look up `key` alone and restore it. Returns the restored key.
    pub async fn restore_key(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.lookup(&[key.to_string()]).await? else {
            return Ok(None);
        };
        self.restore_entry(&entry).await?;
        Ok(Some(entry.key))
    }

    /// Download and extract a looked-up entry.
    ///
    /// When the store database is part of the restore it is reconciled
    /// around the extraction.
    #[instrument(skip(self, entry), fields(key = %entry.key))]
    pub async fn restore_entry(&self, entry: &CacheEntry) -> Result<RestoreReport> {
        let archive_path = self.scratch_archive().await?;

        let started = Instant::now();
        let size = match self.backend.restore(entry, &archive_path).await {
            Ok(size) => size,
            Err(e) => {
                remove_archive(&archive_path).await;
                return Err(e.into());
            }
        };
        let download_time = started.elapsed();
        info!(size, elapsed_ms = download_time.as_millis(), "Downloaded archive");

        let extracted = self.extract(&archive_path).await;
        remove_archive(&archive_path).await;
        let extract_time = extracted?;

        let report = RestoreReport {
            key: entry.key.clone(),
            version: self.version.clone(),
            scope: entry.scope.clone().unwrap_or_default(),
            size,
            download_time,
            extract_time,
        };
        if let Err(e) = self.backend.report_restore(&report).await {
            debug!(error = %e, "Failed to report restore timings");
        }
        Ok(report)
    }

    async fn extract(&self, archive_path: &Path) -> Result<std::time::Duration> {
        let pending = match &self.reconciler {
            Some(reconciler) => reconciler.begin().await?,
            None => None,
        };

        let started = Instant::now();
        if let Err(e) = self.archiver.extract(archive_path).await {
            if let Some(pending) = pending {
                pending.abandon().await;
            }
            return Err(e);
        }
        let extract_time = started.elapsed();

        if let Some(pending) = pending {
            pending.finish().await?;
        }
        Ok(extract_time)
    }

    /// Archive the configured paths and upload them under `key`
    #[instrument(skip(self))]
    pub async fn save(&self, key: &str) -> Result<CommitSummary> {
        self.checkpoint_store_database().await;

        let archive_path = self.scratch_archive().await?;
        let started = Instant::now();
        let result = match self.archiver.create(&self.archive_paths, &archive_path).await {
            Ok(_) => {
                let archive_time = started.elapsed();
                self.backend
                    .save(SaveRequest {
                        key,
                        version: &self.version,
                        archive_path: &archive_path,
                        archive_time,
                    })
                    .await
                    .map_err(Error::from)
            }
            Err(e) => Err(e),
        };
        remove_archive(&archive_path).await;
        result
    }

    /// Entries whose key starts with `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        Ok(self.backend.list(prefix).await?)
    }

    /// Delete the entry with exactly `key`
    pub async fn delete(&self, key: &str) -> Result<()> {
        Ok(self.backend.delete(key).await?)
    }

    /// Flush the store database WAL so the archived file is self-contained
    async fn checkpoint_store_database(&self) {
        let Some(reconciler) = &self.reconciler else {
            return;
        };
        let database = reconciler.database().clone();
        if !database.exists() {
            return;
        }
        match tokio::task::spawn_blocking(move || database.checkpoint()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to checkpoint the store database"),
            Err(e) => warn!(error = %e, "Store database checkpoint task failed"),
        }
    }

    async fn scratch_archive(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| Error::io(e, &self.scratch_dir, "create"))?;
        Ok(self
            .scratch_dir
            .join(format!("{}.tzst", uuid::Uuid::new_v4())))
    }
}

async fn remove_archive(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove archive");
    }
}
