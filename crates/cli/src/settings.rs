//! Configuration loading
//!
//! The only place that reads the process environment. Inputs arrive
//! through clap; everything the runner exports about the job is captured
//! here once and turned into typed configuration.

use crate::cli::CacheInputs;
use crate::errors::CliError;
use cachenix_cache::config::{
    parse_bool, parse_multiline, parse_non_negative, resolve_paths,
};
use cachenix_cache::{
    CacheConfig, FailOn, GcPolicy, HostOs, PurgeOverwrite, PurgePolicy, RestorePolicy,
    STATE_PRIMARY_KEY, STATE_RESTORED_KEY,
};
use cachenix_remote::{
    ArtifactCacheConfig, BackendConfig, BackendKind, DEFAULT_BUILDJET_CACHE_URL,
    DEFAULT_GITHUB_API_URL, GithubApiConfig, TransferConfig,
};
use cachenix_store::parse_gc_max;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// State slots read back from `STATE_<NAME>` variables
const STATE_SLOTS: [&str; 2] = [STATE_PRIMARY_KEY, STATE_RESTORED_KEY];

/// What the runner tells the job about its environment
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Artifact-cache endpoint of the GitHub Actions service
    pub actions_cache_url: Option<String>,
    /// Results endpoint of the GitHub Actions service
    pub actions_results_url: Option<String>,
    /// Token for the artifact-cache protocol
    pub runtime_token: Option<String>,
    /// Artifact-cache endpoint of the BuildJet service
    pub buildjet_cache_url: String,
    /// GitHub REST base URL
    pub github_api_url: String,
    /// `owner/name` of the repository
    pub repository: Option<String>,
    /// Ref the job runs for
    pub git_ref: Option<String>,
    /// Multi-connection downloads enabled
    pub parallel_download: bool,
    /// File receiving state records
    pub state_file: Option<PathBuf>,
    /// File receiving output records
    pub output_file: Option<PathBuf>,
    /// Runner scratch directory
    pub runner_temp: Option<PathBuf>,
    /// Home directory for `~` expansion
    pub home: Option<PathBuf>,
    /// Checkout directory relative cached paths are resolved against
    pub workspace: Option<PathBuf>,
    /// State written by an earlier phase of the job
    pub saved_state: BTreeMap<String, String>,
}

impl Settings {
    /// Capture the process environment
    pub fn from_env() -> Self {
        let mut settings = Self::from_lookup(|name| std::env::var(name).ok());
        if settings.home.is_none() {
            settings.home = dirs::home_dir();
        }
        settings
    }

    /// Build settings from a variable lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let actions_cache_url = overridable(&var, "ACTIONS_CACHE_URL");
        let actions_results_url = overridable(&var, "ACTIONS_RESULTS_URL");

        let saved_state = STATE_SLOTS
            .iter()
            .filter_map(|slot| {
                var(&format!("STATE_{slot}")).map(|value| ((*slot).to_string(), value))
            })
            .collect();

        Self {
            actions_cache_url,
            actions_results_url,
            runtime_token: var("ACTIONS_RUNTIME_TOKEN"),
            buildjet_cache_url: var("BUILDJET_CACHE_URL")
                .unwrap_or_else(|| DEFAULT_BUILDJET_CACHE_URL.to_string()),
            github_api_url: var("GITHUB_API_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            repository: var("GITHUB_REPOSITORY"),
            git_ref: var("GITHUB_REF"),
            parallel_download: var("PARALLEL_DOWNLOAD").is_none_or(|v| v != "false"),
            state_file: var("GITHUB_STATE").map(PathBuf::from),
            output_file: var("GITHUB_OUTPUT").map(PathBuf::from),
            runner_temp: var("RUNNER_TEMP").map(PathBuf::from),
            home: var("HOME").map(PathBuf::from),
            workspace: var("GITHUB_WORKSPACE").map(PathBuf::from),
            saved_state,
        }
    }

    /// Cache tokens are only issued to jobs tied to a ref
    pub fn is_valid_event(&self) -> bool {
        self.git_ref.is_some()
    }

    /// Remote backend configuration for `inputs`
    pub fn backend_config(&self, inputs: &CacheInputs) -> Result<BackendConfig, CliError> {
        let kind: BackendKind = inputs.backend.parse()?;
        let token = self.runtime_token.clone().unwrap_or_default();

        let transfer = TransferConfig {
            upload_chunk_size: parse_non_negative("upload-chunk-size", &inputs.upload_chunk_size)
                .filter(|size| *size > 0),
            parallel_download: self.parallel_download,
            ..TransferConfig::default()
        };

        let github = GithubApiConfig::new(
            self.repository.clone().unwrap_or_default(),
            self.git_ref.clone().unwrap_or_default(),
            inputs.token.clone(),
        )
        .with_api_url(self.github_api_url.clone());

        Ok(BackendConfig {
            kind,
            actions: ArtifactCacheConfig::new(
                self.actions_cache_url.clone().unwrap_or_default(),
                token.clone(),
            ),
            buildjet: ArtifactCacheConfig::new(self.buildjet_cache_url.clone(), token),
            github,
            transfer,
        })
    }

    /// Workflow configuration for `inputs` on `host`
    pub fn cache_config(
        &self,
        inputs: &CacheInputs,
        host: HostOs,
    ) -> Result<CacheConfig, CliError> {
        let paths = host.choose(
            parse_multiline(&inputs.paths),
            non_empty_lines(inputs.paths_linux.as_deref()),
            non_empty_lines(inputs.paths_macos.as_deref()),
        );

        let mut config = CacheConfig::new(inputs.key.trim(), resolve_paths(&paths));
        config.restore = RestorePolicy {
            first_match_keys: parse_multiline(&inputs.restore_first_match_keys),
            all_matches_keys: parse_multiline(&inputs.restore_all_matches_keys),
            skip_restore_on_hit_primary_key: parse_bool(&inputs.skip_restore_on_hit_primary_key),
            fail_on: parse_fail_on(&inputs.fail_on)?,
        };
        config.purge = PurgePolicy {
            enabled: parse_bool(&inputs.purge),
            overwrite: PurgeOverwrite::from_input(&inputs.purge_overwrite),
            keys: parse_multiline(&inputs.purge_keys),
            last_accessed_max_age_secs: parse_non_negative(
                "purge-last-accessed-max-age",
                &inputs.purge_last_accessed_max_age,
            ),
            created_max_age_secs: parse_non_negative(
                "purge-created-max-age",
                &inputs.purge_created_max_age,
            ),
        };
        config.gc = GcPolicy {
            max_store_size: gc_max_store_size(inputs, host),
        };
        config.cross_os_archive = parse_bool(&inputs.cross_os_archive);
        config.merge_store_database = parse_bool(&inputs.merge_store_database);
        if let Some(runner_temp) = &self.runner_temp {
            config.scratch_dir = runner_temp.join("cachenix");
        }
        if let Some(workspace) = &self.workspace {
            config.working_dir.clone_from(workspace);
        }

        config.validate()?;
        debug!(?config, "Loaded cache configuration");
        Ok(config)
    }
}

/// `NAME`, unless `CUSTOM_NAME` redefines it
fn overridable(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    match var(&format!("CUSTOM_{name}")) {
        Some(custom) => {
            info!(url = %custom, "Redefining {name}");
            Some(custom)
        }
        None => var(name),
    }
}

fn non_empty_lines(input: Option<&str>) -> Option<Vec<String>> {
    input.map(parse_multiline).filter(|lines| !lines.is_empty())
}

fn parse_fail_on(input: &str) -> Result<Option<FailOn>, CliError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    input.parse().map(Some).map_err(|e: cachenix_cache::Error| {
        CliError::config_with_help(
            e.to_string(),
            "Use one of primary.miss, primary.not-restored, first-match.miss, first-match.not-restored",
        )
    })
}

/// Store size budget, the platform-specific input winning when it parses
pub fn gc_max_store_size(inputs: &CacheInputs, host: HostOs) -> Option<u64> {
    let parse = |input: Option<&String>| input.and_then(|value| parse_gc_max(value.trim()));
    host.choose(
        parse(inputs.gc_max_store_size.as_ref()),
        parse(inputs.gc_max_store_size_linux.as_ref()).map(Some),
        parse(inputs.gc_max_store_size_macos.as_ref()).map(Some),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn inputs() -> CacheInputs {
        CacheInputs {
            key: "linux-v1".into(),
            backend: "buildjet".into(),
            purge_overwrite: "default".into(),
            merge_store_database: "true".into(),
            ..CacheInputs::default()
        }
    }

    #[test]
    fn test_custom_url_overrides_runner_url() {
        let settings = Settings::from_lookup(lookup(&[
            ("ACTIONS_CACHE_URL", "https://runner/"),
            ("CUSTOM_ACTIONS_CACHE_URL", "https://custom/"),
            ("ACTIONS_RESULTS_URL", "https://results/"),
        ]));
        assert_eq!(settings.actions_cache_url.as_deref(), Some("https://custom/"));
        assert_eq!(settings.actions_results_url.as_deref(), Some("https://results/"));
    }

    #[test]
    fn test_defaults_without_environment() {
        let settings = Settings::from_lookup(lookup(&[]));
        assert_eq!(settings.buildjet_cache_url, DEFAULT_BUILDJET_CACHE_URL);
        assert_eq!(settings.github_api_url, DEFAULT_GITHUB_API_URL);
        assert!(settings.parallel_download);
        assert!(!settings.is_valid_event());
        assert!(settings.saved_state.is_empty());
    }

    #[test]
    fn test_empty_ref_is_not_a_valid_event() {
        let settings = Settings::from_lookup(lookup(&[("GITHUB_REF", "")]));
        assert!(!settings.is_valid_event());
        let settings = Settings::from_lookup(lookup(&[("GITHUB_REF", "refs/heads/main")]));
        assert!(settings.is_valid_event());
    }

    #[test]
    fn test_parallel_download_switch() {
        let settings = Settings::from_lookup(lookup(&[("PARALLEL_DOWNLOAD", "false")]));
        assert!(!settings.parallel_download);
    }

    #[test]
    fn test_saved_state_slots() {
        let settings = Settings::from_lookup(lookup(&[
            ("STATE_CACHE_PRIMARY_KEY", "linux-v1"),
            ("STATE_OTHER", "ignored"),
        ]));
        assert_eq!(
            settings.saved_state.get(STATE_PRIMARY_KEY).map(String::as_str),
            Some("linux-v1")
        );
        assert_eq!(settings.saved_state.len(), 1);
    }

    #[test]
    fn test_backend_config() {
        let settings = Settings::from_lookup(lookup(&[
            ("ACTIONS_RUNTIME_TOKEN", "runtime"),
            ("GITHUB_REPOSITORY", "owner/repo"),
            ("GITHUB_REF", "refs/heads/main"),
        ]));
        let mut inputs = inputs();
        inputs.upload_chunk_size = "33554432".into();
        inputs.token = "gh".into();

        let config = settings.backend_config(&inputs).unwrap();
        assert_eq!(config.kind, BackendKind::Buildjet);
        assert_eq!(config.buildjet.token, "runtime");
        assert_eq!(config.github.repository, "owner/repo");
        assert_eq!(config.github.token, "gh");
        assert_eq!(config.transfer.upload_chunk_size, Some(33_554_432));

        inputs.backend = "gitlab".into();
        assert!(settings.backend_config(&inputs).is_err());
    }

    #[test]
    fn test_cache_config_from_inputs() {
        let settings = Settings::from_lookup(lookup(&[("RUNNER_TEMP", "/runner/tmp")]));
        let mut inputs = inputs();
        inputs.paths = "/opt/a\n! /opt/a/skip\n".into();
        inputs.restore_first_match_keys = "linux-\n".into();
        inputs.fail_on = "first-match.miss".into();
        inputs.purge = "true".into();
        inputs.purge_keys = "linux-".into();
        inputs.purge_created_max_age = "86400".into();
        inputs.purge_last_accessed_max_age = "-5".into();
        inputs.gc_max_store_size = Some("8G".into());

        let config = settings.cache_config(&inputs, HostOs::Linux).unwrap();
        assert_eq!(config.primary_key, "linux-v1");
        assert!(config.paths.contains(&"/nix/".to_string()));
        assert!(config.paths.contains(&"!/opt/a/skip".to_string()));
        assert_eq!(config.restore.first_match_keys, vec!["linux-"]);
        assert_eq!(config.restore.fail_on.map(|f| f.to_string()).as_deref(), Some("first-match.miss"));
        assert!(config.purge.enabled);
        assert_eq!(config.purge.created_max_age_secs, Some(86_400));
        assert_eq!(config.purge.last_accessed_max_age_secs, None);
        assert_eq!(config.gc.max_store_size, Some(8 * 1024 * 1024 * 1024));
        assert_eq!(config.scratch_dir, PathBuf::from("/runner/tmp/cachenix"));
        assert!(config.merge_store_database);
    }

    #[test]
    fn test_workspace_resolves_relative_paths() {
        let settings =
            Settings::from_lookup(lookup(&[("GITHUB_WORKSPACE", "/home/runner/work/app")]));
        let config = settings.cache_config(&inputs(), HostOs::Linux).unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/home/runner/work/app"));

        let unset = Settings::from_lookup(lookup(&[]));
        let config = unset.cache_config(&inputs(), HostOs::Linux).unwrap();
        assert!(config.working_dir.is_absolute());
    }

    #[test]
    fn test_platform_paths_replace_common_paths() {
        let settings = Settings::from_lookup(lookup(&[]));
        let mut inputs = inputs();
        inputs.paths = "/common".into();
        inputs.paths_linux = Some("/linux-only".into());
        inputs.paths_macos = Some(String::new());

        let linux = settings.cache_config(&inputs, HostOs::Linux).unwrap();
        assert!(linux.paths.contains(&"/linux-only".to_string()));
        assert!(!linux.paths.contains(&"/common".to_string()));

        let macos = settings.cache_config(&inputs, HostOs::Macos).unwrap();
        assert!(macos.paths.contains(&"/common".to_string()));
    }

    #[test]
    fn test_platform_gc_budget() {
        let mut inputs = inputs();
        inputs.gc_max_store_size = Some("1G".into());
        inputs.gc_max_store_size_macos = Some("2G".into());
        assert_eq!(gc_max_store_size(&inputs, HostOs::Linux), Some(1 << 30));
        assert_eq!(gc_max_store_size(&inputs, HostOs::Macos), Some(2 << 30));
        assert_eq!(gc_max_store_size(&CacheInputs::default(), HostOs::Linux), None);
    }

    #[test]
    fn test_invalid_fail_on_is_a_configuration_error() {
        let settings = Settings::from_lookup(lookup(&[]));
        let mut inputs = inputs();
        inputs.fail_on = "primary.sometimes".into();
        let err = settings.cache_config(&inputs, HostOs::Linux).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        temp_env::with_vars(
            [
                ("GITHUB_REF", Some("refs/heads/main")),
                ("BUILDJET_CACHE_URL", Some("https://buildjet.test/")),
                ("HOME", Some("/home/runner")),
            ],
            || {
                let settings = Settings::from_env();
                assert!(settings.is_valid_event());
                assert_eq!(settings.buildjet_cache_url, "https://buildjet.test/");
                assert_eq!(settings.home, Some(PathBuf::from("/home/runner")));
            },
        );
    }
}
