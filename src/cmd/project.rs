//! Project initialization: `stagehand init`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::Cli;

pub fn cmd_init(cli: &Cli, project_dir: &Path) -> Result<()> {
    use stagehand::config::Config;
    use stagehand::workflow_config::WorkflowToml;

    stagehand::logging::init(cli.verbose, None)?;

    std::fs::create_dir_all(project_dir)
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;
    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    let was_initialized = config.is_initialized();
    config.ensure_directories()?;

    let wrote_config = !config.config_file.exists();
    if wrote_config {
        WorkflowToml::default().save(&config.config_file)?;
    }

    if was_initialized {
        println!(
            "Stagehand project already initialized at {}",
            config.state_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!(
        "Initialized stagehand project at {}",
        config.state_dir.display()
    );
    println!();
    println!("Created directory structure:");
    println!("  .stagehand/");
    if wrote_config {
        println!("  ├── stagehand.toml  # Workflow configuration");
    }
    println!("  ├── tasks/          # Task records and artifacts");
    println!("  │   └── done/       # Archived tasks");
    println!("  └── logs/           # Orchestrator logs");
    println!();
    println!("Next steps:");
    println!("  1. Add validation commands to .stagehand/stagehand.toml");
    println!("  2. Run `stagehand start <name> --type feature` to start a task");
    Ok(())
}
