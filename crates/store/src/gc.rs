//! Size-bounded garbage collection of the local Nix store
//!
//! A threshold trigger: when the store is larger than the configured
//! maximum, ask Nix to free the difference. Leftover dot entries directly
//! under `/nix` (temporary roots, interrupted installs) are removed before
//! a save so they never end up in an archive.

use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Reads the store size and frees space
#[async_trait]
pub trait StoreCollector: Send + Sync {
    /// Total NAR size of all valid store paths, in bytes
    async fn store_size(&self) -> Result<u64>;

    /// Delete unreachable paths until at least `bytes` are freed
    async fn collect(&self, bytes: u64) -> Result<()>;

    /// Remove dot entries directly under the Nix root; returns how many
    async fn remove_stray_files(&self) -> Result<usize> {
        Ok(0)
    }
}

/// [`StoreCollector`] backed by the `nix` command
#[derive(Debug, Clone)]
pub struct NixStoreCli {
    program: PathBuf,
    nix_root: PathBuf,
}

impl Default for NixStoreCli {
    fn default() -> Self {
        Self::new("nix")
    }
}

impl NixStoreCli {
    /// Use the `nix` binary at `program`
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            nix_root: PathBuf::from("/nix"),
        }
    }

    /// Look for stray entries under `nix_root` instead of `/nix`
    #[must_use]
    pub fn with_nix_root(mut self, nix_root: impl Into<PathBuf>) -> Self {
        self.nix_root = nix_root.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        run_command(&self.program, args).await
    }
}

async fn run_command(program: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let command = format!("{} {}", program.display(), args.join(" "));
    debug!(%command, "Running");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| StoreError::Command {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(StoreError::CommandFailed {
            command,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Entries of `root` whose names start with a dot
async fn stray_entries(root: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io("read", root, e)),
    };
    let mut stray = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io("read", root, e))?
    {
        if entry.file_name().to_string_lossy().starts_with('.') {
            stray.push(entry.path());
        }
    }
    stray.sort();
    Ok(stray)
}

/// Remove `path`, escalating through non-interactive `sudo` when the
/// entry belongs to another user
async fn remove_entry(path: &Path) -> Result<()> {
    let removed = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            let target = path.to_string_lossy();
            run_command(Path::new("sudo"), &["-n", "rm", "-rf", &target]).await?;
            Ok(())
        }
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

#[async_trait]
impl StoreCollector for NixStoreCli {
    async fn store_size(&self) -> Result<u64> {
        let stdout = self.run(&["path-info", "--json", "--all"]).await?;
        let info: Value = serde_json::from_slice(&stdout).map_err(|e| StoreError::Output {
            command: "nix path-info --json --all".into(),
            message: e.to_string(),
        })?;
        total_nar_size(&info).ok_or_else(|| StoreError::Output {
            command: "nix path-info --json --all".into(),
            message: "expected a list or map of path info objects".into(),
        })
    }

    async fn collect(&self, bytes: u64) -> Result<()> {
        let max = bytes.to_string();
        self.run(&["store", "gc", "--max", &max]).await?;
        Ok(())
    }

    async fn remove_stray_files(&self) -> Result<usize> {
        let stray = stray_entries(&self.nix_root).await?;
        for path in &stray {
            debug!(path = %path.display(), "Removing stray entry");
            remove_entry(path).await?;
        }
        if !stray.is_empty() {
            info!(count = stray.len(), root = %self.nix_root.display(), "Removed useless files");
        }
        Ok(stray.len())
    }
}

/// Sum `narSize` over `nix path-info --json` output.
///
/// Older Nix prints an array of objects, newer Nix an object keyed by
/// store path. Paths without a size count as zero.
fn total_nar_size(info: &Value) -> Option<u64> {
    let nar_size = |entry: &Value| entry.get("narSize").and_then(Value::as_u64).unwrap_or(0);
    match info {
        Value::Array(entries) => Some(entries.iter().map(nar_size).sum()),
        Value::Object(entries) => Some(entries.values().map(nar_size).sum()),
        _ => None,
    }
}

/// Result of a garbage collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcOutcome {
    /// Store size before collection
    pub store_size: u64,
    /// Configured maximum
    pub max_size: u64,
    /// Bytes Nix was asked to free, if collection ran
    pub requested: Option<u64>,
}

impl GcOutcome {
    /// Whether a collection was requested
    #[must_use]
    pub const fn collected(&self) -> bool {
        self.requested.is_some()
    }
}

/// Collect garbage if the store exceeds `max_size` bytes
#[instrument(skip(collector))]
pub async fn collect_garbage(collector: &dyn StoreCollector, max_size: u64) -> Result<GcOutcome> {
    let store_size = collector.store_size().await?;
    info!(store_size, max_size, "Current store size in bytes");

    if store_size <= max_size {
        debug!("Store is within budget, nothing to collect");
        return Ok(GcOutcome {
            store_size,
            max_size,
            requested: None,
        });
    }

    let to_free = store_size - max_size;
    info!(to_free, "Collecting garbage");
    collector.collect(to_free).await?;

    if let Ok(after) = collector.store_size().await {
        info!(store_size = after, "Finished collecting garbage");
    }

    Ok(GcOutcome {
        store_size,
        max_size,
        requested: Some(to_free),
    })
}

/// Parse a store size in Nix's notation: decimal digits with an optional
/// trailing `K`, `M` or `G` (binary multiples).
///
/// Returns `None` for empty or malformed input and on overflow.
#[must_use]
pub fn parse_gc_max(input: &str) -> Option<u64> {
    let (digits, shift) = match input.as_bytes().last()? {
        b'K' => (&input[..input.len() - 1], 10),
        b'M' => (&input[..input.len() - 1], 20),
        b'G' => (&input[..input.len() - 1], 30),
        _ => (input, 0),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    value.checked_mul(1_u64 << shift)
}
