//! Restore-time reconciliation of the live store database
//!
//! A restore extracts an archived `db.sqlite` over the live one while the
//! Nix daemon may still be registering paths. [`Reconciler::begin`] takes
//! the `prior` snapshot before extraction; [`PendingMerge::finish`] takes
//! the `restored` snapshot, merges both, checks the result and only then
//! installs it. Apart from WAL checkpoints, nothing before the install
//! step writes to the live path.

use crate::database::{StoreDatabase, integrity_check};
use crate::error::{Result, StoreError};
use crate::merge::{MergeStats, merge_snapshots};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

const PRIOR_SNAPSHOT: &str = "prior.sqlite";
const RESTORED_SNAPSHOT: &str = "restored.sqlite";
const MERGED_DATABASE: &str = "merged.sqlite";

/// Wraps an archive extraction with snapshot and merge steps
#[derive(Debug, Clone)]
pub struct Reconciler {
    database: StoreDatabase,
    scratch_dir: PathBuf,
}

impl Reconciler {
    /// Reconcile `database`, keeping snapshots in `scratch_dir`
    #[must_use]
    pub fn new(database: StoreDatabase, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            database,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// The live database
    #[must_use]
    pub const fn database(&self) -> &StoreDatabase {
        &self.database
    }

    /// Snapshot the live database before the restore touches it.
    ///
    /// Returns `None` when there is no live database yet; the restored
    /// one is then used as is.
    #[instrument(skip(self), fields(db = %self.database.path().display()))]
    pub async fn begin(&self) -> Result<Option<PendingMerge>> {
        if !self.database.exists() {
            info!("No live store database, skipping reconciliation");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| StoreError::io("create", &self.scratch_dir, e))?;

        let database = self.database.clone();
        let prior = self.scratch_dir.join(PRIOR_SNAPSHOT);
        let target = prior.clone();
        blocking(move || database.snapshot(&target)).await?;
        info!("Took store database snapshot before restore");

        Ok(Some(PendingMerge {
            database: self.database.clone(),
            scratch_dir: self.scratch_dir.clone(),
            prior,
        }))
    }
}

/// A reconciliation waiting for the restore to finish
#[derive(Debug)]
#[must_use = "a pending merge must be finished or abandoned"]
pub struct PendingMerge {
    database: StoreDatabase,
    scratch_dir: PathBuf,
    prior: PathBuf,
}

impl PendingMerge {
    /// Path of the snapshot taken before the restore
    #[must_use]
    pub fn prior_snapshot(&self) -> &Path {
        &self.prior
    }

    /// Snapshot the restored database, merge, verify and install.
    ///
    /// An integrity failure leaves the live database untouched.
    #[instrument(skip(self), fields(db = %self.database.path().display()))]
    pub async fn finish(self) -> Result<MergeStats> {
        let restored = self.scratch_dir.join(RESTORED_SNAPSHOT);
        let merged = self.scratch_dir.join(MERGED_DATABASE);

        let database = self.database.clone();
        let prior = self.prior.clone();
        let (restored_path, merged_path) = (restored.clone(), merged.clone());
        let stats = blocking(move || {
            if database.exists() {
                database.snapshot(&restored_path)?;
            } else {
                // The archive did not carry a database; keep the live rows
                std::fs::copy(&prior, &restored_path)
                    .map_err(|e| StoreError::io("copy", &restored_path, e))?;
            }
            let stats = merge_snapshots(&prior, &restored_path, &merged_path)?;
            integrity_check(&merged_path)?;
            database.install_from(&merged_path)?;
            Ok(stats)
        })
        .await?;

        info!(
            valid_paths = stats.valid_paths,
            refs = stats.refs,
            derivation_outputs = stats.derivation_outputs,
            "Reconciled store database"
        );
        remove_scratch(&[&self.prior, &restored, &merged]).await;
        Ok(stats)
    }

    /// Drop the snapshot without touching the live database
    pub async fn abandon(self) {
        remove_scratch(&[&self.prior]).await;
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

async fn remove_scratch(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::STORE_SCHEMA;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn register(path: &Path, store_paths: &[&str]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(STORE_SCHEMA).unwrap();
        for store_path in store_paths {
            conn.execute(
                "insert into ValidPaths (path, hash, registrationTime) values (?1, 'sha256:00', 0)",
                [store_path],
            )
            .unwrap();
        }
    }

    fn registered(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn.prepare("select path from ValidPaths order by path").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[tokio::test]
    async fn test_restore_keeps_live_and_cached_paths() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("db.sqlite");
        register(&live, &["/nix/store/live"]);

        let reconciler = Reconciler::new(StoreDatabase::new(&live), temp.path().join("scratch"));
        let pending = reconciler.begin().await.unwrap().expect("live database");
        assert!(pending.prior_snapshot().exists());

        // The restore overwrites the live file with the archived database
        let archived = temp.path().join("archived.sqlite");
        register(&archived, &["/nix/store/cached"]);
        std::fs::copy(&archived, &live).unwrap();

        let stats = pending.finish().await.unwrap();
        assert_eq!(stats.valid_paths, 2);
        assert_eq!(registered(&live), vec!["/nix/store/cached", "/nix/store/live"]);
        assert!(!temp.path().join("scratch").join(PRIOR_SNAPSHOT).exists());
        assert!(!temp.path().join("scratch").join(MERGED_DATABASE).exists());
    }

    #[tokio::test]
    async fn test_no_live_database_skips() {
        let temp = TempDir::new().unwrap();
        let reconciler = Reconciler::new(
            StoreDatabase::new(temp.path().join("db.sqlite")),
            temp.path().join("scratch"),
        );
        assert!(reconciler.begin().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_restore_leaves_live_database() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("db.sqlite");
        register(&live, &["/nix/store/live"]);

        let reconciler = Reconciler::new(StoreDatabase::new(&live), temp.path().join("scratch"));
        let pending = reconciler.begin().await.unwrap().unwrap();

        std::fs::write(&live, b"this is not a database").unwrap();

        assert!(pending.finish().await.is_err());
        assert_eq!(std::fs::read(&live).unwrap(), b"this is not a database");
    }

    #[tokio::test]
    async fn test_abandon_removes_snapshot() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("db.sqlite");
        register(&live, &[]);

        let reconciler = Reconciler::new(StoreDatabase::new(&live), temp.path().join("scratch"));
        let pending = reconciler.begin().await.unwrap().unwrap();
        let prior = pending.prior_snapshot().to_path_buf();
        pending.abandon().await;
        assert!(!prior.exists());
    }
}
