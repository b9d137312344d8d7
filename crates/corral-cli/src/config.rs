//! Configuration and path resolution.
//!
//! Everything lives under one home directory: `$CORRAL_HOME` when set,
//! `~/.corral` otherwise.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// User configuration, stored as JSON in `<home>/config.json`. Missing or
/// unreadable files fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program run inside new panes.
    pub default_program: String,
    /// Confirm pane prompts automatically.
    pub auto_yes: bool,
    /// Prefix for session branch names.
    pub branch_prefix: String,
    /// Minimum gap between persistence writes, in milliseconds.
    pub save_debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_program: "claude".into(),
            auto_yes: false,
            branch_prefix: "corral/".into(),
            save_debounce_ms: 5_000,
        }
    }
}

/// Resolved filesystem locations for this installation.
#[derive(Debug, Clone)]
pub struct Paths {
    pub home_dir: PathBuf,
    pub config_file: PathBuf,
    pub state_file: PathBuf,
}

impl Paths {
    /// Resolve and create the home directory.
    pub fn create() -> Result<Self> {
        let home_dir = match std::env::var("CORRAL_HOME") {
            Ok(home) => PathBuf::from(home),
            Err(_) => dirs_next::home_dir()
                .context("cannot determine home directory")?
                .join(".corral"),
        };

        std::fs::create_dir_all(&home_dir)
            .with_context(|| format!("failed to create {}", home_dir.display()))?;

        Ok(Self {
            config_file: home_dir.join("config.json"),
            state_file: home_dir.join("state.json"),
            home_dir,
        })
    }
}

/// Read the configuration file, defaulting every missing field.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&content).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::{Config, load_config};

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let config = load_config(std::path::Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.default_program, "claude");
        assert_eq!(config.branch_prefix, "corral/");
        assert_eq!(config.save_debounce_ms, 5_000);
        assert!(!config.auto_yes);
    }

    #[test]
    fn partial_files_keep_defaults_for_missing_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_program": "aider"}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.default_program, "aider");
        assert_eq!(config.branch_prefix, "corral/");
    }

    #[test]
    fn malformed_files_fall_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.default_program, Config::default().default_program);
    }
}
