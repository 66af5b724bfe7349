//! CI runner state and output files
//!
//! Values are appended as `NAME<<DELIMITER` records, one random delimiter
//! per record, to the files the runner names in `GITHUB_STATE` and
//! `GITHUB_OUTPUT`. State written by an earlier phase comes back as
//! `STATE_<NAME>` variables, captured in [`Settings`].

use crate::errors::CliError;
use crate::settings::Settings;
use cachenix_cache::{RestoreOutcome, StateStore};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Output names of a restore run
pub mod outputs {
    pub const HIT: &str = "hit";
    pub const HIT_PRIMARY_KEY: &str = "hit-primary-key";
    pub const HIT_FIRST_MATCH: &str = "hit-first-match";
    pub const RESTORED_KEY: &str = "restored-key";
    pub const RESTORED_KEYS: &str = "restored-keys";
}

/// State and outputs of the current job
#[derive(Debug)]
pub struct GithubActionsIo {
    state_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    state: Mutex<BTreeMap<String, String>>,
}

impl GithubActionsIo {
    /// Files and saved state from `settings`
    pub fn new(settings: &Settings) -> Self {
        Self {
            state_file: settings.state_file.clone(),
            output_file: settings.output_file.clone(),
            state: Mutex::new(settings.saved_state.clone()),
        }
    }

    /// Set a step output. Without an output file it is printed to stdout.
    #[allow(clippy::print_stdout)]
    pub fn set_output(&self, name: &str, value: &str) -> Result<(), CliError> {
        match &self.output_file {
            Some(path) => append_record(path, name, value),
            None => {
                println!("{name}={value}");
                Ok(())
            }
        }
    }

    /// Publish the outputs of a restore run
    pub fn write_restore_outputs(&self, outcome: &RestoreOutcome) -> Result<(), CliError> {
        let restored_keys = serde_json::to_string(&outcome.restored_keys)
            .map_err(|e| CliError::config(format!("failed to encode restored keys: {e}")))?;
        self.set_output(outputs::HIT, bool_output(outcome.hit()))?;
        self.set_output(outputs::HIT_PRIMARY_KEY, bool_output(outcome.hit_primary_key))?;
        self.set_output(outputs::HIT_FIRST_MATCH, bool_output(outcome.hit_first_match))?;
        self.set_output(
            outputs::RESTORED_KEY,
            outcome.restored_key.as_deref().unwrap_or_default(),
        )?;
        self.set_output(outputs::RESTORED_KEYS, &restored_keys)
    }

    /// Publish the outputs of a run that restored nothing
    pub fn reset_restore_outputs(&self) -> Result<(), CliError> {
        self.write_restore_outputs(&RestoreOutcome::default())
    }
}

impl StateStore for GithubActionsIo {
    fn get(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> cachenix_cache::Result<()> {
        if let Some(path) = &self.state_file {
            append_record(path, name, value).map_err(|e| match e {
                CliError::Io { source, path, .. } => {
                    cachenix_cache::Error::io(source, path, "append state to")
                }
                other => cachenix_cache::Error::configuration(other.to_string()),
            })?;
        } else {
            debug!(%name, "No state file, keeping state in memory");
        }
        if let Ok(mut state) = self.state.lock() {
            state.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }
}

const fn bool_output(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// One `NAME<<DELIMITER` record
fn format_record(name: &str, value: &str, delimiter: &str) -> Result<String, CliError> {
    if name.contains(delimiter) || value.contains(delimiter) {
        return Err(CliError::config(format!(
            "value of {name} contains the record delimiter"
        )));
    }
    Ok(format!("{name}<<{delimiter}\n{value}\n{delimiter}\n"))
}

fn append_record(path: &Path, name: &str, value: &str) -> Result<(), CliError> {
    let delimiter = format!("ghadelimiter_{}", Uuid::new_v4());
    let record = format_record(name, value, &delimiter)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CliError::io(e, path, "open"))?;
    file.write_all(record.as_bytes())
        .map_err(|e| CliError::io(e, path, "append to"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachenix_cache::{STATE_PRIMARY_KEY, STATE_RESTORED_KEY};
    use tempfile::TempDir;

    fn io_in(dir: &TempDir) -> GithubActionsIo {
        let settings = Settings {
            state_file: Some(dir.path().join("state")),
            output_file: Some(dir.path().join("output")),
            ..Settings::default()
        };
        GithubActionsIo::new(&settings)
    }

    /// Parse records back into name/value pairs
    fn records(path: &Path) -> Vec<(String, String)> {
        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        let mut records = Vec::new();
        while let Some(header) = lines.next() {
            let (name, delimiter) = header.split_once("<<").unwrap();
            let mut value = Vec::new();
            for line in lines.by_ref() {
                if line == delimiter {
                    break;
                }
                value.push(line);
            }
            records.push((name.to_string(), value.join("\n")));
        }
        records
    }

    #[test]
    fn test_record_format() {
        let record = format_record("hit", "true", "EOF").unwrap();
        assert_eq!(record, "hit<<EOF\ntrue\nEOF\n");
        assert!(format_record("hit", "a EOF b", "EOF").is_err());
    }

    #[test]
    fn test_state_is_appended_and_readable() {
        let dir = TempDir::new().unwrap();
        let io = io_in(&dir);
        io.set(STATE_PRIMARY_KEY, "linux-v1").unwrap();
        io.set(STATE_RESTORED_KEY, "").unwrap();

        assert_eq!(io.get(STATE_PRIMARY_KEY).as_deref(), Some("linux-v1"));
        assert_eq!(
            records(&dir.path().join("state")),
            vec![
                (STATE_PRIMARY_KEY.to_string(), "linux-v1".to_string()),
                (STATE_RESTORED_KEY.to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_saved_state_from_earlier_phase() {
        let mut saved = BTreeMap::new();
        saved.insert(STATE_PRIMARY_KEY.to_string(), "from-restore".to_string());
        let settings = Settings {
            saved_state: saved,
            ..Settings::default()
        };
        let io = GithubActionsIo::new(&settings);
        assert_eq!(io.get(STATE_PRIMARY_KEY).as_deref(), Some("from-restore"));
        assert_eq!(io.get(STATE_RESTORED_KEY), None);
    }

    #[test]
    fn test_restore_outputs() {
        let dir = TempDir::new().unwrap();
        let io = io_in(&dir);
        let outcome = RestoreOutcome {
            hit_primary_key: false,
            hit_first_match: true,
            restored_key: Some("linux-v1".into()),
            restored_keys: vec!["linux-v1".into(), "deps-a".into()],
        };
        io.write_restore_outputs(&outcome).unwrap();

        let records = records(&dir.path().join("output"));
        let get = |name: &str| {
            records
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get(outputs::HIT), "true");
        assert_eq!(get(outputs::HIT_PRIMARY_KEY), "false");
        assert_eq!(get(outputs::HIT_FIRST_MATCH), "true");
        assert_eq!(get(outputs::RESTORED_KEY), "linux-v1");
        assert_eq!(get(outputs::RESTORED_KEYS), r#"["linux-v1","deps-a"]"#);
    }

    #[test]
    fn test_reset_outputs() {
        let dir = TempDir::new().unwrap();
        let io = io_in(&dir);
        io.reset_restore_outputs().unwrap();

        let records = records(&dir.path().join("output"));
        assert_eq!(records.len(), 5);
        assert!(records.contains(&(outputs::HIT.to_string(), "false".to_string())));
        assert!(records.contains(&(outputs::RESTORED_KEYS.to_string(), "[]".to_string())));
    }
}
