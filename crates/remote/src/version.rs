//! Cache version fingerprint
//!
//! The version partitions the remote cache: two lookups only match when
//! their versions are equal, whatever their keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Salt appended to every version; bump it to invalidate all entries
pub const VERSION_SALT: &str = "1.0";

const COMPONENT_DELIMITER: &str = "|";
const WINDOWS_ONLY: &str = "windows-only";

/// Compression method tag folded into the version
///
/// Archives are always written as zstd without long-distance matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMethod {
    /// zstd without long-distance matching
    ZstdWithoutLong,
}

impl CompressionMethod {
    /// Tag used in the version fingerprint
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ZstdWithoutLong => "zstd-without-long",
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 fingerprint of the cached paths and archive settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    /// Compute the version for the current host
    #[must_use]
    pub fn compute<S: AsRef<str>>(
        paths: &[S],
        compression: Option<CompressionMethod>,
        cross_os_archive: bool,
    ) -> Self {
        Self::compute_for_platform(paths, compression, cross_os_archive, cfg!(windows))
    }

    /// Compute the version as it would be on a Windows or non-Windows host
    #[must_use]
    pub fn compute_for_platform<S: AsRef<str>>(
        paths: &[S],
        compression: Option<CompressionMethod>,
        cross_os_archive: bool,
        windows: bool,
    ) -> Self {
        let mut components: Vec<&str> = paths.iter().map(AsRef::as_ref).collect();

        if let Some(method) = compression {
            components.push(method.as_str());
        }

        if windows && !cross_os_archive {
            components.push(WINDOWS_ONLY);
        }

        components.push(VERSION_SALT);

        let digest = Sha256::digest(components.join(COMPONENT_DELIMITER).as_bytes());
        Self(hex::encode(digest))
    }

    /// Wrap an already computed version string
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
