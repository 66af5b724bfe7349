//! Archive creation and extraction
//!
//! The remote side only sees an opaque blob. [`TarZstdArchiver`] produces
//! a zstd-compressed tar whose entries are stored relative to a root
//! directory, so extraction under the same root puts every path back.

use crate::error::{Error, Result};
use async_trait::async_trait;
use cachenix_remote::CompressionMethod;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Turns a set of paths into one archive file and back
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Compression tag that feeds the cache version
    fn compression_method(&self) -> CompressionMethod;

    /// Archive the absolute `paths` into `archive_path`
    async fn create(&self, paths: &[PathBuf], archive_path: &Path) -> Result<ArchiveStats>;

    /// Extract `archive_path` into place
    async fn extract(&self, archive_path: &Path) -> Result<ArchiveStats>;
}

/// Entry counts of one archive operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries written or unpacked
    pub entries: usize,
    /// Entries left out
    pub skipped: usize,
}

/// zstd-compressed tar archiver
#[derive(Debug, Clone)]
pub struct TarZstdArchiver {
    root: PathBuf,
    level: i32,
}

impl Default for TarZstdArchiver {
    fn default() -> Self {
        Self::new("/")
    }
}

impl TarZstdArchiver {
    /// Archiver storing entries relative to `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            level: 3,
        }
    }

    /// Set the zstd compression level
    #[must_use]
    pub const fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Root the entries are relative to
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Archiver for TarZstdArchiver {
    fn compression_method(&self) -> CompressionMethod {
        CompressionMethod::ZstdWithoutLong
    }

    async fn create(&self, paths: &[PathBuf], archive_path: &Path) -> Result<ArchiveStats> {
        let root = self.root.clone();
        let level = self.level;
        let paths = paths.to_vec();
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || write_archive(&root, level, &paths, &archive_path))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn extract(&self, archive_path: &Path) -> Result<ArchiveStats> {
        let root = self.root.clone();
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_archive(&root, &archive_path))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}

fn write_archive(
    root: &Path,
    level: i32,
    paths: &[PathBuf],
    archive_path: &Path,
) -> Result<ArchiveStats> {
    let file = fs::File::create(archive_path).map_err(|e| Error::io(e, archive_path, "create"))?;
    let mut encoder = zstd::Encoder::new(file, level)
        .map_err(|e| Error::archive(format!("zstd encoder error: {e}")))?;
    if let Ok(threads) = std::thread::available_parallelism()
        && let Err(e) = encoder.multithread(u32::try_from(threads.get()).unwrap_or(1))
    {
        debug!(error = %e, "Multithreaded zstd unavailable, compressing on one thread");
    }

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    for path in paths {
        let relative = path.strip_prefix(root).map_err(|_| {
            Error::configuration(format!(
                "path {} is not under archive root {}",
                path.display(),
                root.display()
            ))
        })?;
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Cached path does not exist, skipping");
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(Error::io(e, path, "stat")),
        };

        let appended = if metadata.is_dir() {
            builder.append_dir_all(relative, path)
        } else {
            builder.append_path_with_name(path, relative)
        };
        appended.map_err(|e| Error::archive(format!("tar append {} failed: {e}", path.display())))?;
        stats.entries += 1;
    }

    if stats.entries == 0 {
        drop(builder);
        let _ = fs::remove_file(archive_path);
        return Err(Error::configuration(
            "Path Validation Error: Path(s) specified for caching do not exist, hence no cache is being saved",
        ));
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::archive(format!("tar finalize failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::archive(format!("zstd finish failed: {e}")))?;
    info!(
        archive = %archive_path.display(),
        paths = stats.entries,
        "Created archive"
    );
    Ok(stats)
}

fn unpack_archive(root: &Path, archive_path: &Path) -> Result<ArchiveStats> {
    let file = fs::File::open(archive_path).map_err(|e| Error::io(e, archive_path, "open"))?;
    let decoder = zstd::Decoder::new(file)
        .map_err(|e| Error::archive(format!("zstd decoder error: {e}")))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut stats = ArchiveStats::default();
    let entries = archive
        .entries()
        .map_err(|e| Error::archive(format!("tar read failed: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::archive(format!("tar read failed: {e}")))?;
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        match entry.unpack_in(root) {
            Ok(true) => stats.entries += 1,
            Ok(false) => {
                debug!(entry = %name, "Skipping entry outside the archive root");
                stats.skipped += 1;
            }
            // Read-only store paths that already exist cannot be overwritten
            Err(e) => {
                debug!(entry = %name, error = %e, "Skipping entry that cannot be written");
                stats.skipped += 1;
            }
        }
    }

    info!(
        archive = %archive_path.display(),
        entries = stats.entries,
        skipped = stats.skipped,
        "Extracted archive"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_and_extract_under_root() {
        let root = TempDir::new().unwrap();
        let store = root.path().join("nix/store/abc-hello");
        fs::create_dir_all(store.join("bin")).unwrap();
        fs::write(store.join("bin/hello"), "#!/bin/sh\necho hello\n").unwrap();
        fs::write(root.path().join("single.txt"), "one file").unwrap();

        let scratch = TempDir::new().unwrap();
        let archive = scratch.path().join("cache.tzst");
        let archiver = TarZstdArchiver::new(root.path());

        let created = archiver
            .create(
                &[root.path().join("nix"), root.path().join("single.txt")],
                &archive,
            )
            .await
            .unwrap();
        assert_eq!(created.entries, 2);

        fs::remove_dir_all(root.path().join("nix")).unwrap();
        fs::remove_file(root.path().join("single.txt")).unwrap();

        archiver.extract(&archive).await.unwrap();
        assert_eq!(
            fs::read_to_string(store.join("bin/hello")).unwrap(),
            "#!/bin/sh\necho hello\n"
        );
        assert_eq!(
            fs::read_to_string(root.path().join("single.txt")).unwrap(),
            "one file"
        );
    }

    #[tokio::test]
    async fn test_missing_paths_are_skipped() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("present"), "x").unwrap();
        let archive = root.path().join("cache.tzst");

        let stats = TarZstdArchiver::new(root.path())
            .create(
                &[root.path().join("present"), root.path().join("absent")],
                &archive,
            )
            .await
            .unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_nothing_to_archive_is_error() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("cache.tzst");

        let err = TarZstdArchiver::new(root.path())
            .create(&[root.path().join("absent")], &archive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_path_outside_root_is_rejected() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let archive = root.path().join("cache.tzst");

        let err = TarZstdArchiver::new(root.path().join("sub"))
            .create(&[elsewhere.path().to_path_buf()], &archive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_compression_method() {
        assert_eq!(
            TarZstdArchiver::default().compression_method(),
            CompressionMethod::ZstdWithoutLong
        );
    }
}
