//! Initialization module for hive projects.
//!
//! `hive init` creates the `.hive/` directory structure in a project:
//!
//! ```text
//! .hive/
//! ├── hive.toml        # Configuration (defaults written on first init)
//! ├── .gitignore       # Keeps run data and worktrees out of version control
//! ├── agents/          # Optional agent definitions (<agent>.md)
//! ├── workflows/       # Optional custom workflows (<name>.yaml)
//! ├── runs/            # One directory per run: state, events, checkpoints
//! └── logs/            # Diagnostic logs
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::hive_config::{CONFIG_FILE, HiveToml};

/// The name of the hive configuration directory.
pub const HIVE_DIR: &str = ".hive";

const GITIGNORE: &str = "runs/\nlogs/\nworktrees/\ncurrent\n";

/// Result of initializing a hive project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.hive` directory
    pub hive_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
}

/// Initialize a hive project in the given directory.
///
/// Idempotent: an existing `.hive/` is completed, never overwritten.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let hive_dir = project_dir.join(HIVE_DIR);
    let created = !hive_dir.exists();

    std::fs::create_dir_all(&hive_dir)
        .with_context(|| format!("Failed to create directory: {}", hive_dir.display()))?;
    ensure_directory_structure(&hive_dir)?;

    Ok(InitResult { hive_dir, created })
}

/// Ensure all required subdirectories and files exist.
fn ensure_directory_structure(hive_dir: &Path) -> Result<()> {
    for sub in ["agents", "workflows", "runs", "logs"] {
        let dir = hive_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {} directory: {}", sub, dir.display()))?;
    }

    let config_file = hive_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        HiveToml::default().save(&config_file)?;
    }

    let gitignore = hive_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to create {}", gitignore.display()))?;
    }

    Ok(())
}

/// Check if a project is already initialized with hive.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(HIVE_DIR).is_dir()
}

/// Get the path to the hive directory for a project.
pub fn get_hive_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(HIVE_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_hive_directory() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.created);
        assert_eq!(result.hive_dir, dir.path().join(".hive"));
        for sub in ["agents", "workflows", "runs", "logs"] {
            assert!(result.hive_dir.join(sub).is_dir(), "missing {}", sub);
        }
        assert!(result.hive_dir.join("hive.toml").is_file());
        assert!(is_initialized(dir.path()));
    }

    #[test]
    fn test_default_config_is_loadable() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();
        let toml = HiveToml::load(&result.hive_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(toml.defaults.max_attempts, 3);
    }

    #[test]
    fn test_init_is_idempotent_and_preserves_config() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let config = dir.path().join(".hive/hive.toml");
        std::fs::write(&config, "[defaults]\nmax_attempts = 9\n").unwrap();

        let second = init_project(dir.path()).unwrap();
        assert!(!second.created);
        assert!(std::fs::read_to_string(&config).unwrap().contains("max_attempts = 9"));
    }

    #[test]
    fn test_not_initialized() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
        assert_eq!(get_hive_dir(dir.path()), dir.path().join(".hive"));
    }
}
