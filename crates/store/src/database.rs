//! Access to the live Nix store database file
//!
//! The Nix daemon keeps its SQLite database in WAL mode. Before the file
//! can be copied the write-ahead log is checkpointed into the main file;
//! after a merged database replaces it the `-wal` and `-shm` side files
//! are removed because SQLite regenerates them from the main file.

use crate::error::{Result, StoreError};
use rusqlite::{Connection, OpenFlags};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Standard location of the Nix store database
pub const DEFAULT_STORE_DB: &str = "/nix/var/nix/db/db.sqlite";

/// How long to wait for the daemon to release its write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// The live store database and its side files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDatabase {
    path: PathBuf,
}

impl Default for StoreDatabase {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_DB)
    }
}

impl StoreDatabase {
    /// Database at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Main database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write-ahead log file
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.side_file("-wal")
    }

    /// Shared-memory index file
    #[must_use]
    pub fn shm_path(&self) -> PathBuf {
        self.side_file("-shm")
    }

    fn side_file(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Whether the main file exists
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Flush the write-ahead log into the main file and truncate it
    pub fn checkpoint(&self) -> Result<()> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::database("open", &self.path, e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StoreError::database("configure", &self.path, e))?;

        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| StoreError::database("checkpoint", &self.path, e))?;

        if busy != 0 {
            warn!(
                path = %self.path.display(),
                log_frames,
                checkpointed,
                "Checkpoint could not complete while the database was busy"
            );
        } else {
            debug!(path = %self.path.display(), log_frames, "Checkpointed database");
        }
        Ok(())
    }

    /// Checkpoint, then copy the main file to `destination`
    pub fn snapshot(&self, destination: &Path) -> Result<()> {
        self.checkpoint()?;
        std::fs::copy(&self.path, destination)
            .map_err(|e| StoreError::io("copy", destination, e))?;
        debug!(
            from = %self.path.display(),
            to = %destination.display(),
            "Copied database snapshot"
        );
        Ok(())
    }

    /// Replace the live database with `merged`.
    ///
    /// The merged file is first copied next to the live one so the final
    /// rename stays on one filesystem.
    pub fn install_from(&self, merged: &Path) -> Result<()> {
        let staging = self.side_file(".cachenix-merged");
        std::fs::copy(merged, &staging).map_err(|e| StoreError::io("copy", &staging, e))?;

        for side in [self.wal_path(), self.shm_path()] {
            match std::fs::remove_file(&side) {
                Ok(()) => debug!(path = %side.display(), "Removed database side file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("remove", &side, e)),
            }
        }

        std::fs::rename(&staging, &self.path)
            .map_err(|e| StoreError::io("rename", &self.path, e))?;
        info!(path = %self.path.display(), "Installed merged store database");
        Ok(())
    }
}

/// Run the engine's consistency checks on the database at `path`.
///
/// Both `PRAGMA integrity_check` and `PRAGMA foreign_key_check` must come
/// back clean.
pub fn integrity_check(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| StoreError::database("open", path, e))?;

    let problems = collect_rows(&conn, path, "PRAGMA integrity_check", |row| row.get(0))?;
    if problems != ["ok"] {
        return Err(StoreError::integrity(path, problems.join("; ")));
    }

    let violations = collect_rows(&conn, path, "PRAGMA foreign_key_check", |row| {
        let table: String = row.get(0)?;
        let rowid: Option<i64> = row.get(1)?;
        let parent: String = row.get(2)?;
        Ok(format!(
            "{table} row {} references missing {parent}",
            rowid.map_or_else(|| "?".to_string(), |r| r.to_string())
        ))
    })?;
    if !violations.is_empty() {
        return Err(StoreError::integrity(path, violations.join("; ")));
    }

    debug!(path = %path.display(), "Integrity check passed");
    Ok(())
}

fn collect_rows<F>(conn: &Connection, path: &Path, sql: &str, map: F) -> Result<Vec<String>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<String>,
{
    let mut statement = conn
        .prepare(sql)
        .map_err(|e| StoreError::database("integrity check", path, e))?;
    let rows = statement
        .query_map([], map)
        .map_err(|e| StoreError::database("integrity check", path, e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StoreError::database("integrity check", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wal_database(dir: &Path) -> (StoreDatabase, Connection) {
        let db = StoreDatabase::new(dir.join("db.sqlite"));
        let conn = Connection::open(db.path()).unwrap();
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())).unwrap();
        conn.execute_batch("create table t (x integer); insert into t values (1), (2);")
            .unwrap();
        (db, conn)
    }

    #[test]
    fn test_side_file_paths() {
        let db = StoreDatabase::default();
        assert_eq!(db.path(), Path::new("/nix/var/nix/db/db.sqlite"));
        assert_eq!(db.wal_path(), Path::new("/nix/var/nix/db/db.sqlite-wal"));
        assert_eq!(db.shm_path(), Path::new("/nix/var/nix/db/db.sqlite-shm"));
    }

    #[test]
    fn test_snapshot_includes_uncheckpointed_writes() {
        let temp = TempDir::new().unwrap();
        // Keep the writer open so the rows sit in the WAL
        let (db, _writer) = wal_database(temp.path());

        let copy = temp.path().join("copy.sqlite");
        db.snapshot(&copy).unwrap();

        let conn = Connection::open(&copy).unwrap();
        let count: i64 = conn
            .query_row("select count(*) from t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_install_replaces_file_and_removes_side_files() {
        let temp = TempDir::new().unwrap();
        let db = StoreDatabase::new(temp.path().join("db.sqlite"));
        std::fs::write(db.path(), b"live").unwrap();
        std::fs::write(db.wal_path(), b"wal").unwrap();
        std::fs::write(db.shm_path(), b"shm").unwrap();

        let merged = temp.path().join("merged.sqlite");
        std::fs::write(&merged, b"merged").unwrap();

        db.install_from(&merged).unwrap();

        assert_eq!(std::fs::read(db.path()).unwrap(), b"merged");
        assert!(!db.wal_path().exists());
        assert!(!db.shm_path().exists());
        assert!(merged.exists());
    }

    #[test]
    fn test_integrity_check_passes_on_clean_database() {
        let temp = TempDir::new().unwrap();
        let (db, conn) = wal_database(temp.path());
        drop(conn);
        integrity_check(db.path()).unwrap();
    }

    #[test]
    fn test_integrity_check_reports_foreign_key_violations() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fk.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = OFF;
             create table parent (id integer primary key);
             create table child (parent integer references parent(id));
             insert into child values (42);",
        )
        .unwrap();
        drop(conn);

        let err = integrity_check(&path).unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(err.to_string().contains("child"));
    }

    #[test]
    fn test_checkpoint_missing_database_fails() {
        let temp = TempDir::new().unwrap();
        let db = StoreDatabase::new(temp.path().join("absent.sqlite"));
        assert!(!db.exists());
        assert!(matches!(
            db.checkpoint().unwrap_err(),
            StoreError::Database { .. }
        ));
    }
}
