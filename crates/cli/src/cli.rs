//! Command-line surface
//!
//! Every workflow input is both a flag and a CI input variable. Runners
//! export an input named `paths-linux` as `INPUT_PATHS-LINUX`, so the
//! variable names keep their hyphens.

use crate::tracing::{LogLevel, TracingFormat};
use clap::{Args, Parser, Subcommand};

/// Remote build cache for Nix stores in CI.
#[derive(Parser, Debug)]
#[command(name = "cachenix")]
#[command(about = "Restore, save and purge a remote build cache for Nix stores in CI")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Logging verbosity level.
    #[arg(long, global = true, default_value = "info", value_enum)]
    pub log_level: LogLevel,

    /// Log output format.
    #[arg(long, global = true, default_value = "compact", value_enum)]
    pub log_format: TracingFormat,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore caches and record the primary key for a later save
    Restore {
        #[command(flatten)]
        inputs: CacheInputs,
    },

    /// Restore caches without handing state to a later save
    RestoreOnly {
        #[command(flatten)]
        inputs: CacheInputs,
    },

    /// Save the cached paths under the primary key
    Save {
        #[command(flatten)]
        inputs: CacheInputs,
    },

    /// Delete stale caches and print the selected keys
    Purge {
        #[command(flatten)]
        inputs: CacheInputs,

        /// Select without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Collect garbage in the local Nix store
    Gc {
        #[command(flatten)]
        inputs: CacheInputs,
    },
}

/// Workflow inputs
///
/// Values are raw strings; parsing and validation happen when the
/// configuration is built.
#[derive(Args, Debug, Clone, Default)]
pub struct CacheInputs {
    /// Primary key to restore and save
    #[arg(long, env = "INPUT_KEY", default_value = "")]
    pub key: String,

    /// Newline-separated paths to cache
    #[arg(long, env = "INPUT_PATHS", default_value = "")]
    pub paths: String,

    /// Paths to cache on Linux, replacing --paths when set
    #[arg(long, env = "INPUT_PATHS-LINUX")]
    pub paths_linux: Option<String>,

    /// Paths to cache on macOS, replacing --paths when set
    #[arg(long, env = "INPUT_PATHS-MACOS")]
    pub paths_macos: Option<String>,

    /// Prefixes tried in order when the primary key misses
    #[arg(long, env = "INPUT_RESTORE-FIRST-MATCH-KEYS", default_value = "")]
    pub restore_first_match_keys: String,

    /// Prefixes whose every cache is restored when the primary key misses
    #[arg(long, env = "INPUT_RESTORE-ALL-MATCHES-KEYS", default_value = "")]
    pub restore_all_matches_keys: String,

    /// Do not download a cache that matched the primary key
    #[arg(long, env = "INPUT_SKIP-RESTORE-ON-HIT-PRIMARY-KEY", default_value = "false")]
    pub skip_restore_on_hit_primary_key: String,

    /// Fail on <primary|first-match>.<miss|not-restored>
    #[arg(long, env = "INPUT_FAIL-ON", default_value = "")]
    pub fail_on: String,

    /// Collect store garbage above this size (K, M and G suffixes allowed)
    #[arg(long, env = "INPUT_GC-MAX-STORE-SIZE")]
    pub gc_max_store_size: Option<String>,

    /// Store size budget on Linux
    #[arg(long, env = "INPUT_GC-MAX-STORE-SIZE-LINUX")]
    pub gc_max_store_size_linux: Option<String>,

    /// Store size budget on macOS
    #[arg(long, env = "INPUT_GC-MAX-STORE-SIZE-MACOS")]
    pub gc_max_store_size_macos: Option<String>,

    /// Purge stale caches after saving
    #[arg(long, env = "INPUT_PURGE", default_value = "false")]
    pub purge: String,

    /// How purging treats the primary key: always, never or default
    #[arg(long, env = "INPUT_PURGE-OVERWRITE", default_value = "default")]
    pub purge_overwrite: String,

    /// Newline-separated key prefixes eligible for purging
    #[arg(long, env = "INPUT_PURGE-KEYS", default_value = "")]
    pub purge_keys: String,

    /// Purge caches last accessed more than this many seconds ago
    #[arg(long, env = "INPUT_PURGE-LAST-ACCESSED-MAX-AGE", default_value = "")]
    pub purge_last_accessed_max_age: String,

    /// Purge caches created more than this many seconds ago
    #[arg(long, env = "INPUT_PURGE-CREATED-MAX-AGE", default_value = "")]
    pub purge_created_max_age: String,

    /// Upload chunk size in bytes
    #[arg(long, env = "INPUT_UPLOAD-CHUNK-SIZE", default_value = "")]
    pub upload_chunk_size: String,

    /// Token for listing and deleting caches through the GitHub API
    #[arg(long, env = "INPUT_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Cache service: actions or buildjet
    #[arg(long, env = "INPUT_BACKEND", default_value = "buildjet")]
    pub backend: String,

    /// Allow archives to be restored on a different OS
    #[arg(long, env = "INPUT_CROSS-OS-ARCHIVE", default_value = "false")]
    pub cross_os_archive: String,

    /// Merge the Nix store database instead of overwriting it on restore
    #[arg(long, env = "INPUT_MERGE-STORE-DATABASE", default_value = "true")]
    pub merge_store_database: String,
}

/// Parse command line arguments and the input environment
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Cli {
        const fn inputs(&self) -> &CacheInputs {
            match &self.command {
                Commands::Restore { inputs }
                | Commands::RestoreOnly { inputs }
                | Commands::Save { inputs }
                | Commands::Purge { inputs, .. }
                | Commands::Gc { inputs } => inputs,
            }
        }
    }

    #[test]
    fn test_flags_parse_into_inputs() {
        let cli = Cli::try_parse_from([
            "cachenix",
            "restore",
            "--key",
            "linux-v1",
            "--restore-first-match-keys",
            "linux-",
            "--fail-on",
            "primary.miss",
        ])
        .unwrap();
        let inputs = cli.inputs();
        assert_eq!(inputs.key, "linux-v1");
        assert_eq!(inputs.restore_first_match_keys, "linux-");
        assert_eq!(inputs.fail_on, "primary.miss");
        assert_eq!(inputs.backend, "buildjet");
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn test_inputs_come_from_environment() {
        temp_env::with_vars(
            [
                ("INPUT_KEY", Some("from-env")),
                ("INPUT_PURGE-KEYS", Some("a-\nb-")),
            ],
            || {
                let cli = Cli::try_parse_from(["cachenix", "save"]).unwrap();
                assert_eq!(cli.inputs().key, "from-env");
                assert_eq!(cli.inputs().purge_keys, "a-\nb-");
            },
        );
    }

    #[test]
    fn test_purge_dry_run_flag() {
        let cli = Cli::try_parse_from(["cachenix", "purge", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Commands::Purge { dry_run: true, .. }));
    }

    #[test]
    fn test_global_log_options() {
        let cli =
            Cli::try_parse_from(["cachenix", "gc", "--log-level", "debug", "--log-format", "json"])
                .unwrap();
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(cli.log_format, TracingFormat::Json);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
