//! Typed cache configuration and input parsing
//!
//! Everything here is built once at the top of a workflow and passed down
//! by reference. The parsing helpers take raw input strings; reading them
//! from the environment is the binary's job.

use crate::error::{Error, Result};
use cachenix_store::DEFAULT_STORE_DB;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Paths cached in addition to the configured ones
pub const DEFAULT_PATHS: [&str; 3] = ["/nix/", "~/.cache/nix", "~root/.cache/nix"];

/// Which lookup a fail-on policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupStage {
    /// Exact lookup of the primary key
    Primary,
    /// Prefix lookup over the first-match keys
    FirstMatch,
}

impl LookupStage {
    /// Input spelling
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::FirstMatch => "first-match",
        }
    }
}

/// Outcome a fail-on policy escalates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailCondition {
    /// Nothing matched
    Miss,
    /// Something matched but could not be restored
    NotRestored,
}

impl FailCondition {
    /// Input spelling
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::NotRestored => "not-restored",
        }
    }
}

/// `<primary|first-match>.<miss|not-restored>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailOn {
    /// Lookup the policy watches
    pub stage: LookupStage,
    /// Outcome that fails the workflow
    pub condition: FailCondition,
}

impl FailOn {
    /// Whether this policy escalates `condition` at `stage`
    #[must_use]
    pub fn applies(&self, stage: LookupStage, condition: FailCondition) -> bool {
        self.stage == stage && self.condition == condition
    }
}

impl fmt::Display for FailOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage.as_str(), self.condition.as_str())
    }
}

impl FromStr for FailOn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::configuration(format!(
                "invalid fail-on value '{s}', expected <primary|first-match>.<miss|not-restored>"
            ))
        };
        let (stage, condition) = s.trim().split_once('.').ok_or_else(invalid)?;
        let stage = match stage {
            "primary" => LookupStage::Primary,
            "first-match" => LookupStage::FirstMatch,
            _ => return Err(invalid()),
        };
        let condition = match condition {
            "miss" => FailCondition::Miss,
            "not-restored" => FailCondition::NotRestored,
            _ => return Err(invalid()),
        };
        Ok(Self { stage, condition })
    }
}

/// How purging treats the primary key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeOverwrite {
    /// Always evict the primary key so a fresh entry is saved
    Always,
    /// Never evict the primary key
    Never,
    /// Treat the primary key as one more purge prefix
    #[default]
    Default,
}

impl PurgeOverwrite {
    /// Parse an input value; anything other than `always` or `never` is
    /// the default mode
    #[must_use]
    pub fn from_input(input: &str) -> Self {
        match input.trim() {
            "always" => Self::Always,
            "never" => Self::Never,
            _ => Self::Default,
        }
    }
}

/// Restore-side policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePolicy {
    /// Prefixes tried in order after a primary miss; the first with a hit wins
    #[serde(default)]
    pub first_match_keys: Vec<String>,

    /// Prefixes whose every entry is restored after a primary miss
    #[serde(default)]
    pub all_matches_keys: Vec<String>,

    /// Confirm a primary hit without downloading it
    #[serde(default)]
    pub skip_restore_on_hit_primary_key: bool,

    /// Escalate a miss or failed restore to an error
    #[serde(default)]
    pub fail_on: Option<FailOn>,
}

impl RestorePolicy {
    /// Whether `fail_on` escalates `condition` at `stage`
    #[must_use]
    pub fn fails_on(&self, stage: LookupStage, condition: FailCondition) -> bool {
        self.fail_on.is_some_and(|f| f.applies(stage, condition))
    }
}

/// Remote purge policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgePolicy {
    /// Run purging at all
    #[serde(default)]
    pub enabled: bool,

    /// Treatment of the primary key
    #[serde(default)]
    pub overwrite: PurgeOverwrite,

    /// Key prefixes whose entries are purge candidates
    #[serde(default)]
    pub keys: Vec<String>,

    /// Purge entries last accessed more than this many seconds ago
    #[serde(default)]
    pub last_accessed_max_age_secs: Option<u64>,

    /// Purge entries created more than this many seconds ago
    #[serde(default)]
    pub created_max_age_secs: Option<u64>,
}

impl PurgePolicy {
    /// Last-accessed threshold
    #[must_use]
    pub fn last_accessed_max_age(&self) -> Option<Duration> {
        self.last_accessed_max_age_secs.map(Duration::from_secs)
    }

    /// Creation threshold
    #[must_use]
    pub fn created_max_age(&self) -> Option<Duration> {
        self.created_max_age_secs.map(Duration::from_secs)
    }
}

/// Local store garbage collection policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Collect garbage when the store is larger than this many bytes
    #[serde(default)]
    pub max_store_size: Option<u64>,
}

/// Configuration of one restore or save workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Key the workflow wants to hit and saves under
    pub primary_key: String,

    /// Cached paths as configured; they also feed the version fingerprint
    pub paths: Vec<String>,

    /// Restore policy
    #[serde(default)]
    pub restore: RestorePolicy,

    /// Purge policy
    #[serde(default)]
    pub purge: PurgePolicy,

    /// Garbage collection policy
    #[serde(default)]
    pub gc: GcPolicy,

    /// Share archives between operating systems
    #[serde(default)]
    pub cross_os_archive: bool,

    /// Reconcile the Nix store database across restores
    #[serde(default = "default_true")]
    pub merge_store_database: bool,

    /// Live Nix store database
    #[serde(default = "default_store_database")]
    pub store_database: PathBuf,

    /// Directory for archives and database snapshots
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Root that archive entries are stored relative to
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,

    /// Directory relative cached paths are resolved against
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

impl CacheConfig {
    /// Configuration with default policies
    #[must_use]
    pub fn new(primary_key: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            paths,
            restore: RestorePolicy::default(),
            purge: PurgePolicy::default(),
            gc: GcPolicy::default(),
            cross_os_archive: false,
            merge_store_database: true,
            store_database: default_store_database(),
            scratch_dir: default_scratch_dir(),
            archive_root: default_archive_root(),
            working_dir: default_working_dir(),
        }
    }

    /// Reject configurations no workflow can run with
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::configuration(
                "Path Validation Error: at least one path must be specified",
            ));
        }
        if !self.working_dir.is_absolute() {
            return Err(Error::configuration(format!(
                "working directory {} must be absolute",
                self.working_dir.display()
            )));
        }
        if !self.archive_root.is_absolute() {
            return Err(Error::configuration(format!(
                "archive root {} must be absolute",
                self.archive_root.display()
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_store_database() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_DB)
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("cachenix")
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

/// Host operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    /// Linux
    Linux,
    /// macOS
    Macos,
    /// Anything else
    Other,
}

impl HostOs {
    /// The OS this binary runs on
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::Macos
        } else {
            Self::Other
        }
    }

    /// Pick the platform-specific value when set
    #[must_use]
    pub fn choose<T>(self, common: T, linux: Option<T>, macos: Option<T>) -> T {
        match self {
            Self::Linux => linux.unwrap_or(common),
            Self::Macos => macos.unwrap_or(common),
            Self::Other => common,
        }
    }
}

/// Split a multi-line input into trimmed, non-empty items.
///
/// A `!` followed by whitespace is collapsed so `! path` excludes `path`.
#[must_use]
pub fn parse_multiline(input: &str) -> Vec<String> {
    input
        .split('\n')
        .map(|line| {
            let line = line.trim();
            match line.strip_prefix('!') {
                Some(rest) => format!("!{}", rest.trim_start()),
                None => line.to_string(),
            }
        })
        .filter(|item| !item.is_empty())
        .collect()
}

/// `true` in any letter case is true; everything else is false
#[must_use]
pub fn parse_bool(input: &str) -> bool {
    input.trim().eq_ignore_ascii_case("true")
}

/// Parse a leading non-negative integer the way CI inputs are read:
/// trailing garbage after the digits is ignored.
///
/// Invalid or negative values log a warning naming `name` and yield
/// `None`, which disables the feature the input controls.
#[must_use]
pub fn parse_non_negative(name: &str, input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (negative, unsigned) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let digits_end = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    let digits = &unsigned[..digits_end];

    match digits.parse::<u64>() {
        Ok(0) => Some(0),
        Ok(_) if negative => {
            warn!(input = name, value = %trimmed, "Ignoring negative value");
            None
        }
        Ok(value) => Some(value),
        Err(_) => {
            warn!(input = name, value = %trimmed, "Ignoring value that is not a number");
            None
        }
    }
}

/// Resolve the cached path list: the defaults followed by the configured
/// paths, without duplicates.
#[must_use]
pub fn resolve_paths(configured: &[String]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::with_capacity(DEFAULT_PATHS.len() + configured.len());
    for path in DEFAULT_PATHS
        .iter()
        .map(|p| (*p).to_string())
        .chain(configured.iter().cloned())
    {
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Expand a leading `~` or `~user` in `path`
#[must_use]
pub fn expand_tilde(path: &str, home: Option<&Path>) -> PathBuf {
    let Some(rest) = path.strip_prefix('~') else {
        return PathBuf::from(path);
    };
    let (user, tail) = rest.split_once('/').unwrap_or((rest, ""));

    let base = if user.is_empty() {
        match home {
            Some(home) => home.to_path_buf(),
            None => return PathBuf::from(path),
        }
    } else {
        user_home(user)
    };

    if tail.is_empty() {
        base
    } else {
        base.join(tail)
    }
}

/// Absolute location of a configured path: `~` is expanded and relative
/// paths are taken from `working_dir`
#[must_use]
pub fn resolve_cached_path(path: &str, home: Option<&Path>, working_dir: &Path) -> PathBuf {
    let expanded = expand_tilde(path, home);
    if expanded.is_absolute() {
        expanded
    } else {
        working_dir.join(expanded)
    }
}

fn user_home(user: &str) -> PathBuf {
    match (user, HostOs::current()) {
        ("root", HostOs::Macos) => PathBuf::from("/var/root"),
        ("root", _) => PathBuf::from("/root"),
        (user, HostOs::Macos) => Path::new("/Users").join(user),
        (user, _) => Path::new("/home").join(user),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_on_parse() {
        let policy: FailOn = "first-match.not-restored".parse().unwrap();
        assert_eq!(policy.stage, LookupStage::FirstMatch);
        assert_eq!(policy.condition, FailCondition::NotRestored);
        assert_eq!(policy.to_string(), "first-match.not-restored");

        assert!(" primary.miss ".parse::<FailOn>().is_ok());
        assert!("primary".parse::<FailOn>().is_err());
        assert!("secondary.miss".parse::<FailOn>().is_err());
        assert!("primary.hit".parse::<FailOn>().is_err());
    }

    #[test]
    fn test_restore_policy_fails_on() {
        let policy = RestorePolicy {
            fail_on: Some("primary.miss".parse().unwrap()),
            ..RestorePolicy::default()
        };
        assert!(policy.fails_on(LookupStage::Primary, FailCondition::Miss));
        assert!(!policy.fails_on(LookupStage::Primary, FailCondition::NotRestored));
        assert!(!policy.fails_on(LookupStage::FirstMatch, FailCondition::Miss));
        assert!(!RestorePolicy::default().fails_on(LookupStage::Primary, FailCondition::Miss));
    }

    #[test]
    fn test_purge_overwrite_from_input() {
        assert_eq!(PurgeOverwrite::from_input("always"), PurgeOverwrite::Always);
        assert_eq!(PurgeOverwrite::from_input("never"), PurgeOverwrite::Never);
        assert_eq!(PurgeOverwrite::from_input(""), PurgeOverwrite::Default);
        assert_eq!(PurgeOverwrite::from_input("sometimes"), PurgeOverwrite::Default);
    }

    #[test]
    fn test_parse_multiline() {
        let items = parse_multiline("  /nix/\n\n! /nix/store/x \n~/.cache\n   \n");
        assert_eq!(items, vec!["/nix/", "!/nix/store/x", "~/.cache"]);
        assert!(parse_multiline("").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("yes"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_parse_non_negative() {
        assert_eq!(parse_non_negative("n", "42"), Some(42));
        assert_eq!(parse_non_negative("n", " 7days"), Some(7));
        assert_eq!(parse_non_negative("n", "0"), Some(0));
        assert_eq!(parse_non_negative("n", "-0"), Some(0));
        assert_eq!(parse_non_negative("n", "-5"), None);
        assert_eq!(parse_non_negative("n", "abc"), None);
        assert_eq!(parse_non_negative("n", ""), None);
    }

    #[test]
    fn test_resolve_paths_prepends_defaults() {
        let paths = resolve_paths(&["/nix/".to_string(), "target".to_string()]);
        assert_eq!(
            paths,
            vec!["/nix/", "~/.cache/nix", "~root/.cache/nix", "target"]
        );
    }

    #[test]
    fn test_host_os_choose() {
        assert_eq!(HostOs::Linux.choose(1, Some(2), Some(3)), 2);
        assert_eq!(HostOs::Macos.choose(1, Some(2), Some(3)), 3);
        assert_eq!(HostOs::Linux.choose(1, None, Some(3)), 1);
        assert_eq!(HostOs::Other.choose(1, Some(2), Some(3)), 1);
    }

    #[test]
    fn test_resolve_cached_path() {
        let home = Path::new("/home/runner");
        let workspace = Path::new("/home/runner/work/app");
        assert_eq!(
            resolve_cached_path("target", Some(home), workspace),
            PathBuf::from("/home/runner/work/app/target")
        );
        assert_eq!(
            resolve_cached_path("./node_modules", Some(home), workspace),
            PathBuf::from("/home/runner/work/app/./node_modules")
        );
        assert_eq!(
            resolve_cached_path("~/.cache/nix", Some(home), workspace),
            PathBuf::from("/home/runner/.cache/nix")
        );
        assert_eq!(
            resolve_cached_path("/nix/", Some(home), workspace),
            PathBuf::from("/nix/")
        );
        assert!(resolve_cached_path("~/x", None, workspace).is_absolute());
    }

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/runner");
        assert_eq!(
            expand_tilde("~/.cache/nix", Some(home)),
            PathBuf::from("/home/runner/.cache/nix")
        );
        assert_eq!(expand_tilde("~", Some(home)), PathBuf::from("/home/runner"));
        assert_eq!(expand_tilde("/nix/", Some(home)), PathBuf::from("/nix/"));
        assert_eq!(expand_tilde("~/x", None), PathBuf::from("~/x"));

        let root_cache = expand_tilde("~root/.cache/nix", Some(home));
        assert!(root_cache.ends_with("root/.cache/nix"));
        assert!(root_cache.is_absolute());
    }

    #[test]
    fn test_validate() {
        assert!(CacheConfig::new("k", vec!["/nix/".into()]).validate().is_ok());
        assert!(CacheConfig::new("k", Vec::new()).validate().is_err());

        let mut relative = CacheConfig::new("k", vec!["/nix/".into()]);
        relative.archive_root = PathBuf::from("relative");
        assert!(relative.validate().is_err());
    }
}
