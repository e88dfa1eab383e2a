//! Config-directory loading: one or more YAML files, each a mapping of
//! cron-name to [`CronDefinition`][crate::types::CronDefinition].
//!
//! Loading is intentionally tolerant at two granularities (§6/§7): a file
//! that fails to parse as YAML at all is skipped wholesale and every name
//! it would have defined is unknown to this reload; a file that parses
//! but contains one invalid cron definition only poisons that one name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::types::error::ConfigError;
use crate::types::CronDefinition;

/// Result of one load pass over a config directory.
#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub crons: HashMap<String, CronDefinition>,
    /// name -> human-readable reason, for crons that failed to parse or
    /// validate. Mirrors the scheduler's `bad_crons` set (§4.1).
    pub bad: HashMap<String, String>,
}

/// Load every `*.yaml`/`*.yml` file directly inside `dir` (non-recursive,
/// matching the original crontab-to-config layout) and merge the results.
pub fn load_dir(dir: &Path) -> Result<LoadedConfig, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::DirectoryNotFound {
            path: dir.display().to_string(),
        });
    }

    let mut loaded = LoadedConfig::default();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_yaml(p))
        .collect();
    entries.sort();

    for path in entries {
        load_file(&path, &mut loaded);
    }

    Ok(loaded)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn load_file(path: &Path, loaded: &mut LoadedConfig) {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to read config file");
            return;
        }
    };

    let raw: HashMap<String, CronDefinition> = match serde_yaml::from_str(&contents) {
        Ok(m) => m,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to parse config file; skipping entirely");
            return;
        }
    };

    for (name, mut def) in raw {
        def.name = name.clone();
        def.source_file = path.to_path_buf();
        match validate(&def) {
            Ok(()) => {
                loaded.crons.insert(name, def);
            }
            Err(reason) => {
                warn!(cron = %name, file = %path.display(), %reason, "invalid cron definition");
                loaded.bad.insert(name, reason);
            }
        }
    }
}

fn validate(def: &CronDefinition) -> Result<(), String> {
    if def.command.trim().is_empty() {
        return Err("command must not be empty".to_string());
    }
    if def.targets.is_empty() {
        return Err("targets must not be empty".to_string());
    }
    if def.user.trim().is_empty() {
        return Err("user must not be empty".to_string());
    }
    cron::Schedule::try_from(def.cron_expression().as_str())
        .map_err(|e| format!("invalid cron expression: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = load_dir(Path::new("/does/not/exist")).unwrap_err();
        assert!(matches!(err, ConfigError::DirectoryNotFound { .. }));
    }

    #[test]
    fn loads_valid_definitions_and_skips_invalid_ones() {
        let dir = tempdir().unwrap();
        write_file(
            dir.path(),
            "jobs.yaml",
            r#"
good:
  min: "*"
  hour: "*"
  dom: "*"
  mon: "*"
  dow: "*"
  command: "echo hi"
  user: "root"
  targets: ["a", "b"]
  target_type: list
  number_of_targets: 0
bad:
  min: "*"
  hour: "*"
  dom: "*"
  mon: "*"
  dow: "*"
  command: ""
  user: "root"
  targets: ["a"]
  target_type: list
  number_of_targets: 0
"#,
        );

        let loaded = load_dir(dir.path()).unwrap();
        assert!(loaded.crons.contains_key("good"));
        assert!(loaded.bad.contains_key("bad"));
        assert!(!loaded.crons.contains_key("bad"));
    }

    #[test]
    fn unparseable_file_is_skipped_wholesale() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "broken.yaml", "not: [valid: yaml: at all");
        let loaded = load_dir(dir.path()).unwrap();
        assert!(loaded.crons.is_empty());
        assert!(loaded.bad.is_empty());
    }

    #[test]
    fn non_yaml_files_are_ignored() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "README.md", "not a config file");
        let loaded = load_dir(dir.path()).unwrap();
        assert!(loaded.crons.is_empty());
    }
}
