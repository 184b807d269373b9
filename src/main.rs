use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Stage orchestration for AI-assisted development tasks")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .stagehand/ in the project
    Init,
    /// Create a task and run it
    Start {
        name: String,

        /// feature, bug_fix, refactor, chore, docs or hotfix
        #[arg(long = "type", short = 't')]
        task_type: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Exit at approval gates instead of waiting for a decision
        #[arg(long)]
        no_wait: bool,
    },
    /// Continue a paused, rolled back or interrupted task
    Resume {
        id: String,

        #[arg(long)]
        no_wait: bool,
    },
    /// List tasks
    List {
        /// Include archived tasks
        #[arg(long)]
        all: bool,
    },
    /// Show a task's stage history
    Status { id: String },
    /// Approve the stage a task is waiting on
    Approve { id: String },
    /// Reject the stage a task is waiting on; it re-runs with the reason as feedback
    Reject {
        id: String,

        #[arg(long)]
        reason: String,
    },
    /// Send an operator signal to a task
    Signal {
        id: String,

        kind: SignalKind,

        #[arg(long)]
        feedback: Option<String>,
    },
    /// Run a stage the stage plan recommended skipping
    Unskip {
        id: String,

        /// Stage name, e.g. QA
        stage: String,
    },
    /// Abandon a task
    Abandon {
        id: String,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SignalKind {
    Interrupt,
    Skip,
    Back,
    Pause,
    Edit,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default stagehand.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let start_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let project_dir = stagehand::config::Config::find_project_root(&start_dir)
        .unwrap_or_else(|| start_dir.clone());

    match &cli.command {
        Commands::Init => cmd::cmd_init(&cli, &start_dir)?,
        Commands::Start {
            name,
            task_type,
            description,
            no_wait,
        } => cmd::cmd_start(&cli, project_dir, name, task_type, description, *no_wait).await?,
        Commands::Resume { id, no_wait } => {
            cmd::cmd_resume(&cli, project_dir, id, *no_wait).await?
        }
        Commands::List { all } => cmd::cmd_list(&cli, project_dir, *all)?,
        Commands::Status { id } => cmd::cmd_status(&cli, project_dir, id)?,
        Commands::Approve { id } => cmd::cmd_approve(&cli, project_dir, id).await?,
        Commands::Reject { id, reason } => cmd::cmd_reject(&cli, project_dir, id, reason).await?,
        Commands::Signal { id, kind, feedback } => {
            cmd::cmd_signal(&cli, project_dir, id, *kind, feedback.clone()).await?
        }
        Commands::Unskip { id, stage } => cmd::cmd_unskip(&cli, project_dir, id, stage).await?,
        Commands::Abandon { id, yes } => cmd::cmd_abandon(&cli, project_dir, id, *yes).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
