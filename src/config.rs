use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::workflow_config::WorkflowToml;

/// Name of the state directory inside a project.
pub const STATE_DIR: &str = ".stagehand";
/// Name of the configuration file inside the state directory.
pub const CONFIG_FILE: &str = "stagehand.toml";

/// Runtime configuration for stagehand.
///
/// Resolves the `.stagehand/` layout for a project and carries the parsed
/// `stagehand.toml`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_file: PathBuf,
    pub tasks_dir: PathBuf,
    pub done_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub workflow: WorkflowToml,
}

impl Config {
    /// Create a Config for `project_dir`, loading `stagehand.toml` if present.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let workflow = WorkflowToml::load_or_default(&state_dir)?;
        Ok(Self::with_workflow(project_dir, verbose, workflow))
    }

    /// Create a Config with an already-parsed workflow configuration.
    pub fn with_workflow(project_dir: PathBuf, verbose: bool, workflow: WorkflowToml) -> Self {
        let state_dir = project_dir.join(STATE_DIR);
        let tasks_dir = state_dir.join("tasks");
        Self {
            config_file: state_dir.join(CONFIG_FILE),
            done_dir: tasks_dir.join("done"),
            log_dir: state_dir.join("logs"),
            tasks_dir,
            state_dir,
            project_dir,
            verbose,
            workflow,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tasks_dir).context("Failed to create tasks directory")?;
        std::fs::create_dir_all(&self.done_dir).context("Failed to create done directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Project name from config, falling back to the directory name.
    pub fn project_name(&self) -> String {
        self.workflow
            .project
            .name
            .clone()
            .or_else(|| {
                self.project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "project".to_string())
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }

    /// Walk up from `start` to find the directory containing `.stagehand/`.
    pub fn find_project_root(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .find(|dir| dir.join(STATE_DIR).is_dir())
            .map(Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_layout_is_under_state_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.state_dir, root.join(".stagehand"));
        assert_eq!(config.tasks_dir, root.join(".stagehand/tasks"));
        assert_eq!(config.done_dir, root.join(".stagehand/tasks/done"));
        assert_eq!(config.log_dir, root.join(".stagehand/logs"));
        assert_eq!(config.config_file, root.join(".stagehand/stagehand.toml"));
    }

    #[test]
    fn test_loads_toml_when_present() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".stagehand")).unwrap();
        fs::write(
            dir.path().join(".stagehand/stagehand.toml"),
            "[project]\nname = \"svc\"\n\n[stages]\nmax_retries = 1\n",
        )
        .unwrap();
        let config = Config::new(dir.path().to_path_buf(), true).unwrap();
        assert!(config.verbose);
        assert_eq!(config.workflow.stages.max_retries, 1);
        assert_eq!(config.project_name(), "svc");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".stagehand")).unwrap();
        fs::write(dir.path().join(".stagehand/stagehand.toml"), "[stages\n").unwrap();
        assert!(Config::new(dir.path().to_path_buf(), false).is_err());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert!(!config.is_initialized());
        config.ensure_directories().unwrap();
        assert!(config.tasks_dir.exists());
        assert!(config.done_dir.exists());
        assert!(config.log_dir.exists());
        assert!(config.is_initialized());
    }

    #[test]
    fn test_find_project_root_walks_up() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".stagehand")).unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            Config::find_project_root(&nested).unwrap(),
            dir.path().to_path_buf()
        );
    }
}
