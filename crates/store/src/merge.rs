//! Three-way reconciliation of store database snapshots
//!
//! Two snapshots of the same database, one taken before a restore and one
//! after, are unioned into a copy of the earlier one. Rows are keyed by
//! store path; see `sql/merge.sql` for the conflict rule. Tables the merge
//! does not know about, such as content-addressed realisations, carry over
//! from the earlier snapshot unchanged.

use crate::error::{Result, StoreError};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, instrument};

/// Schema of the tables the merge writes
pub const STORE_SCHEMA: &str = include_str!("../sql/schema.sql");

const MERGE_SQL: &str = include_str!("../sql/merge.sql");

/// Row counts of a merged database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Registered store paths
    pub valid_paths: u64,
    /// Reference edges
    pub refs: u64,
    /// Derivation outputs
    pub derivation_outputs: u64,
}

/// Merge `prior` and `restored` into a new database at `output`.
///
/// `output` starts as a copy of `prior`; an existing file there is
/// replaced. Neither input is modified.
#[instrument(skip_all, fields(output = %output.display()))]
pub fn merge_snapshots(prior: &Path, restored: &Path, output: &Path) -> Result<MergeStats> {
    match std::fs::remove_file(output) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(StoreError::io("remove", output, e)),
    }

    if !prior.is_file() {
        return Err(StoreError::io(
            "copy",
            prior,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    }
    std::fs::copy(prior, output).map_err(|e| StoreError::io("copy", prior, e))?;

    let mut conn = Connection::open(output).map_err(|e| StoreError::database("open", output, e))?;
    // The copy keeps the live journal mode; the merged file must stand alone
    conn.pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get::<_, String>(0))
        .map_err(|e| StoreError::database("set journal mode", output, e))?;
    conn.execute_batch(STORE_SCHEMA)
        .map_err(|e| StoreError::database("create schema", output, e))?;

    attach(&conn, restored, "restored")?;

    let tx = conn
        .transaction()
        .map_err(|e| StoreError::database("merge", output, e))?;
    tx.execute_batch(MERGE_SQL)
        .map_err(|e| StoreError::database("merge", output, e))?;
    tx.commit()
        .map_err(|e| StoreError::database("merge", output, e))?;

    conn.execute_batch("DETACH DATABASE restored;")
        .map_err(|e| StoreError::database("detach", output, e))?;

    let stats = MergeStats {
        valid_paths: count(&conn, output, "ValidPaths")?,
        refs: count(&conn, output, "Refs")?,
        derivation_outputs: count(&conn, output, "DerivationOutputs")?,
    };
    debug!(?stats, "Merged store database snapshots");
    Ok(stats)
}

fn attach(conn: &Connection, path: &Path, alias: &str) -> Result<()> {
    if !path.is_file() {
        return Err(StoreError::io(
            "attach",
            path,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    }
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {alias}"),
        [path.to_string_lossy()],
    )
    .map_err(|e| StoreError::database("attach", path, e))?;
    Ok(())
}

fn count(conn: &Connection, path: &Path, table: &str) -> Result<u64> {
    let rows: i64 = conn
        .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))
        .map_err(|e| StoreError::database("count", path, e))?;
    Ok(u64::try_from(rows).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::integrity_check;
    use tempfile::TempDir;

    fn store_db(path: &Path, paths: &[(i64, &str)]) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
        conn.execute_batch(STORE_SCHEMA).unwrap();
        for (id, store_path) in paths {
            conn.execute(
                "insert into ValidPaths (id, path, hash, registrationTime, narSize) \
                 values (?1, ?2, 'sha256:00', 0, 100)",
                rusqlite::params![id, store_path],
            )
            .unwrap();
        }
        conn
    }

    fn paths_of(path: &Path) -> Vec<(i64, String)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("select id, path from ValidPaths order by id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_concurrent_write_survives_merge() {
        let temp = TempDir::new().unwrap();
        let prior = temp.path().join("prior.sqlite");
        let restored = temp.path().join("restored.sqlite");
        let merged = temp.path().join("merged.sqlite");
        store_db(&prior, &[(1, "/nix/store/a")]);
        store_db(&restored, &[(1, "/nix/store/a"), (2, "/nix/store/b")]);

        let stats = merge_snapshots(&prior, &restored, &merged).unwrap();

        assert_eq!(stats.valid_paths, 2);
        assert_eq!(
            paths_of(&merged),
            vec![(1, "/nix/store/a".to_string()), (2, "/nix/store/b".to_string())]
        );
        integrity_check(&merged).unwrap();
    }

    #[test]
    fn test_colliding_ids_are_rekeyed_by_path() {
        let temp = TempDir::new().unwrap();
        let prior = temp.path().join("prior.sqlite");
        let restored = temp.path().join("restored.sqlite");
        let merged = temp.path().join("merged.sqlite");

        let p = store_db(&prior, &[(1, "/nix/store/live"), (2, "/nix/store/shared")]);
        p.execute("insert into Refs values (1, 2)", []).unwrap();

        let r = store_db(&restored, &[(1, "/nix/store/cached"), (2, "/nix/store/shared")]);
        r.execute("insert into Refs values (1, 2)", []).unwrap();
        r.execute("insert into Refs values (1, 1)", []).unwrap();
        r.execute(
            "insert into DerivationOutputs values (1, 'out', '/nix/store/shared')",
            [],
        )
        .unwrap();
        drop((p, r));

        let stats = merge_snapshots(&prior, &restored, &merged).unwrap();
        assert_eq!(stats.valid_paths, 3);
        assert_eq!(stats.refs, 3);
        assert_eq!(stats.derivation_outputs, 1);

        let rows = paths_of(&merged);
        assert_eq!(rows[0], (1, "/nix/store/live".to_string()));
        assert_eq!(rows[1], (2, "/nix/store/shared".to_string()));
        assert_eq!(rows[2].1, "/nix/store/cached");
        let cached_id = rows[2].0;

        let conn = Connection::open(&merged).unwrap();
        let drv: i64 = conn
            .query_row("select drv from DerivationOutputs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(drv, cached_id);
        let cached_refs: i64 = conn
            .query_row(
                "select count(*) from Refs where referrer = ?1",
                [cached_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(cached_refs, 2);
        drop(conn);

        integrity_check(&merged).unwrap();
    }

    #[test]
    fn test_dangling_references_are_dropped() {
        let temp = TempDir::new().unwrap();
        let prior = temp.path().join("prior.sqlite");
        let restored = temp.path().join("restored.sqlite");
        let merged = temp.path().join("merged.sqlite");

        store_db(&prior, &[]);
        let r = store_db(&restored, &[(1, "/nix/store/a")]);
        r.execute("insert into Refs values (1, 99)", []).unwrap();
        drop(r);

        let stats = merge_snapshots(&prior, &restored, &merged).unwrap();
        assert_eq!(stats.refs, 0);
        integrity_check(&merged).unwrap();
    }

    #[test]
    fn test_dangling_live_references_are_dropped() {
        let temp = TempDir::new().unwrap();
        let prior = temp.path().join("prior.sqlite");
        let restored = temp.path().join("restored.sqlite");
        let merged = temp.path().join("merged.sqlite");

        let p = store_db(&prior, &[(1, "/nix/store/a")]);
        p.execute("insert into Refs values (1, 42)", []).unwrap();
        p.execute("insert into DerivationOutputs values (7, 'out', '/nix/store/x')", [])
            .unwrap();
        drop(p);
        store_db(&restored, &[]);

        let stats = merge_snapshots(&prior, &restored, &merged).unwrap();
        assert_eq!(stats.valid_paths, 1);
        assert_eq!(stats.refs, 0);
        assert_eq!(stats.derivation_outputs, 0);
        integrity_check(&merged).unwrap();
    }

    #[test]
    fn test_unknown_live_tables_survive_merge() {
        let temp = TempDir::new().unwrap();
        let prior = temp.path().join("prior.sqlite");
        let restored = temp.path().join("restored.sqlite");
        let merged = temp.path().join("merged.sqlite");

        let p = store_db(&prior, &[(1, "/nix/store/a")]);
        p.execute_batch(
            "create table Realisations (id integer primary key autoincrement not null, \
                 drvPath text not null, outputName text not null, outputPath integer not null, \
                 signatures text, foreign key (outputPath) references ValidPaths(id) on delete cascade); \
             insert into Realisations (drvPath, outputName, outputPath) \
                 values ('/nix/store/d.drv', 'out', 1);",
        )
        .unwrap();
        drop(p);
        store_db(&restored, &[(1, "/nix/store/b")]);

        let stats = merge_snapshots(&prior, &restored, &merged).unwrap();
        assert_eq!(stats.valid_paths, 2);

        let conn = Connection::open(&merged).unwrap();
        let output_path: String = conn
            .query_row(
                "select v.path from Realisations r join ValidPaths v on v.id = r.outputPath",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(output_path, "/nix/store/a");
        drop(conn);
        integrity_check(&merged).unwrap();
    }

    #[test]
    fn test_merge_replaces_stale_output() {
        let temp = TempDir::new().unwrap();
        let prior = temp.path().join("prior.sqlite");
        let restored = temp.path().join("restored.sqlite");
        let merged = temp.path().join("merged.sqlite");
        store_db(&prior, &[(1, "/nix/store/a")]);
        store_db(&restored, &[(1, "/nix/store/a")]);
        std::fs::write(&merged, b"stale").unwrap();

        let stats = merge_snapshots(&prior, &restored, &merged).unwrap();
        assert_eq!(stats.valid_paths, 1);
    }

    #[test]
    fn test_missing_snapshot_is_io_error() {
        let temp = TempDir::new().unwrap();
        let restored = temp.path().join("restored.sqlite");
        store_db(&restored, &[]);

        let err = merge_snapshots(
            &temp.path().join("absent.sqlite"),
            &restored,
            &temp.path().join("merged.sqlite"),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
