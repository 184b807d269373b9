//! Configuration view and validation commands: `stagehand config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use stagehand::config::{CONFIG_FILE, STATE_DIR};
    use stagehand::stage::{TaskType, template_for};
    use stagehand::workflow_config::WorkflowToml;

    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stagehand Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                WorkflowToml::load(&config_path)?
            } else {
                println!("No stagehand.toml found at {}", config_path.display());
                println!("Using default configuration.");
                WorkflowToml::default()
            };
            println!();

            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Workflows:");
            for task_type in TaskType::all() {
                match template_for(*task_type, &toml) {
                    Ok(template) => {
                        let names: Vec<String> = template
                            .stages
                            .iter()
                            .map(|s| {
                                if s.requires_approval {
                                    format!("{}*", s.name)
                                } else {
                                    s.name.clone()
                                }
                            })
                            .collect();
                        println!("  {:<10} {}", task_type.to_string(), names.join(" -> "));
                    }
                    Err(e) => println!("  {:<10} invalid: {}", task_type.to_string(), e),
                }
            }
            println!("  (* waits for approval)");
            println!();

            println!("Effective values (with env overrides):");
            for stage in ["PLAN", "DEV", "REVIEW"] {
                match toml.backend_for_stage(stage) {
                    Some((name, backend)) => {
                        println!("  {} backend = {} ({})", stage, name, backend.command)
                    }
                    None => println!("  {} backend = (undefined)", stage),
                }
            }
            println!(
                "  hub url = {}",
                toml.hub.url().unwrap_or_else(|| "(disabled)".to_string())
            );
            println!();

            if !config_path.exists() {
                println!("Run 'stagehand config init' to create a stagehand.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No stagehand.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = WorkflowToml::load(&config_path)?;
            let mut problems = toml.validate();
            for task_type in TaskType::all() {
                if let Err(e) = template_for(*task_type, &toml) {
                    problems.push(format!("{} workflow: {}", task_type, e));
                }
            }

            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for problem in problems {
                    println!("  - {}", problem);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stagehand.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&state_dir)
                .with_context(|| format!("Failed to create {}", state_dir.display()))?;
            WorkflowToml::default().save(&config_path)?;

            println!("Created stagehand.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [stages] skip, timeout, max_retries, max_rollbacks_per_hour");
            println!("  - [templates] stage lists per task type");
            println!("  - [validation.<STAGE>] commands, markers, skip_if");
            println!("  - [ai.backends.<name>] backend commands");
            println!("  - [hub] dashboard url");
            println!();
        }
    }

    Ok(())
}
