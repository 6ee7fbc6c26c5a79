use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::hive_config::{HiveConfig, HiveToml};

/// Runtime configuration for Hive.
///
/// Resolves the `.hive/` layout for a project and carries the merged
/// `HiveConfig` so every component reads settings from one place.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub hive_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Pointer file naming the most recent run
    pub current_file: PathBuf,
    pub verbose: bool,
    settings: HiveConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let settings = HiveConfig::with_cli_args(project_dir, verbose, false, None)?;
        Self::from_settings(settings)
    }

    /// Build from an already layered configuration (CLI flags applied).
    pub fn from_settings(settings: HiveConfig) -> Result<Self> {
        let project_dir = settings
            .project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let hive_dir = project_dir.join(crate::init::HIVE_DIR);

        Ok(Self {
            runs_dir: hive_dir.join("runs"),
            agents_dir: hive_dir.join("agents"),
            workflows_dir: hive_dir.join("workflows"),
            log_dir: hive_dir.join("logs"),
            current_file: hive_dir.join("current"),
            verbose: settings.verbose,
            project_dir,
            hive_dir,
            settings,
        })
    }

    pub fn settings(&self) -> &HiveConfig {
        &self.settings
    }

    pub fn toml(&self) -> &HiveToml {
        &self.settings.toml
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_under_hive_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let root = dir.path().canonicalize().unwrap().join(".hive");
        assert_eq!(config.hive_dir, root);
        assert_eq!(config.runs_dir, root.join("runs"));
        assert_eq!(config.run_dir("r1"), root.join("runs").join("r1"));
        assert_eq!(config.current_file, root.join("current"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.runs_dir.is_dir());
        assert!(config.log_dir.is_dir());
    }

    #[test]
    fn test_missing_project_dir_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(Config::new(missing, false).is_err());
    }
}
