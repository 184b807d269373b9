//! CLI command implementations.
//!
//! | Module    | Commands handled                                  |
//! |-----------|---------------------------------------------------|
//! | `project` | `Init`                                            |
//! | `task`    | `Start`, `Resume`, `List`, `Status`               |
//! | `signal`  | `Approve`, `Reject`, `Signal`, `Abandon`          |
//! | `config`  | `Config`                                          |

pub mod config;
pub mod project;
pub mod signal;
pub mod task;

pub use config::cmd_config;
pub use project::cmd_init;
pub use signal::{cmd_abandon, cmd_approve, cmd_reject, cmd_signal, cmd_unskip};
pub use task::{cmd_list, cmd_resume, cmd_start, cmd_status};

use anyhow::{Result, bail};
use std::path::PathBuf;

use super::Cli;
use stagehand::config::Config;
use stagehand::events::EventPublisher;
use stagehand::orchestrator::Orchestrator;

/// Load configuration for an initialized project and install logging.
pub fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<Config> {
    let config = Config::new(project_dir, cli.verbose)?;
    if !config.is_initialized() {
        bail!("Project not initialized. Run 'stagehand init' first.");
    }
    stagehand::logging::init(cli.verbose, Some(&config.log_dir))?;
    Ok(config)
}

/// Orchestrator publishing to the configured hub, if any.
pub fn orchestrator(config: Config) -> Orchestrator {
    let events = EventPublisher::from_config(&config.workflow.hub, &config.project_name());
    Orchestrator::new(config, events)
}
