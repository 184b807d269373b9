//! Task lifecycle commands: `stagehand start`, `resume`, `list` and `status`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::PathBuf;

use super::super::Cli;
use super::{load_config, orchestrator};
use stagehand::orchestrator::{ControlSignal, Orchestrator, RunOutcome};
use stagehand::stage::TaskType;
use stagehand::task::{RunStatus, Task, TaskStatus};

pub async fn cmd_start(
    cli: &Cli,
    project_dir: PathBuf,
    name: &str,
    task_type: &str,
    description: &str,
    no_wait: bool,
) -> Result<()> {
    let task_type: TaskType = task_type.parse()?;
    let config = load_config(cli, project_dir)?;
    for warning in config.workflow.validate() {
        println!("{} {}", style("warning:").yellow(), warning);
    }

    let orch = orchestrator(config);
    let task = orch.create_task(name, task_type, description, Vec::new())?;
    println!(
        "Created task {} ({}) on branch {}",
        style(&task.id).cyan(),
        task.task_type,
        task.branch
    );
    drive(with_gates(orch, no_wait), &task.id).await
}

pub async fn cmd_resume(cli: &Cli, project_dir: PathBuf, id: &str, no_wait: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let orch = orchestrator(config);
    let task = orch
        .store()
        .load(id)
        .with_context(|| format!("Cannot resume {}", id))?;
    if task.status.is_terminal() {
        bail!("Task {} is already {}", task.id, task.status);
    }
    println!(
        "Resuming {} at {}",
        style(&task.id).cyan(),
        task.current_stage.as_deref().unwrap_or("the end of its workflow")
    );
    drive(with_gates(orch, no_wait), &task.id).await
}

fn with_gates(orch: Orchestrator, no_wait: bool) -> Orchestrator {
    if no_wait { orch.detach_at_gates() } else { orch }
}

/// Run a task until it stops. Ctrl-C pauses it.
async fn drive(orch: Orchestrator, id: &str) -> Result<()> {
    let (handle, rx) = orch.control_channel(id);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", style("Pausing; stopping the current stage...").yellow());
            handle.send(ControlSignal::Pause);
        }
    });

    let result = orch.run(id, rx).await;
    ctrl_c.abort();
    let task = orch.store().load(id);
    orch.shutdown().await;

    let outcome = result?;
    let task = task?;
    println!();
    match outcome {
        RunOutcome::Complete => {
            println!("{} Task {} complete", style("✓").green().bold(), task.id);
            println!("  Artifacts: {}", task.artifact_dir.display());
        }
        RunOutcome::Paused => {
            println!(
                "{} Task {} paused: {}",
                style("⏸").yellow(),
                task.id,
                task.status_reason.as_deref().unwrap_or("no reason recorded")
            );
            println!("  Resume with `stagehand resume {}`", task.id);
        }
        RunOutcome::AwaitingApproval => {
            println!(
                "{} {} is waiting for approval",
                style("?").cyan().bold(),
                task.current_stage.as_deref().unwrap_or("stage")
            );
            println!(
                "  Decide with `stagehand approve {id}` or `stagehand reject {id} --reason ...`, \
                 then `stagehand resume {id}`",
                id = task.id
            );
        }
        RunOutcome::Abandoned => {
            println!("{} Task {} abandoned", style("✗").red(), task.id);
        }
        RunOutcome::Failed => {
            bail!(
                "Task {} failed: {}",
                task.id,
                task.status_reason.as_deref().unwrap_or("unknown reason")
            );
        }
    }
    Ok(())
}

fn styled_status(status: TaskStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        TaskStatus::Complete => style(text).green(),
        TaskStatus::Failed | TaskStatus::Abandoned => style(text).red(),
        TaskStatus::WaitingApproval | TaskStatus::Paused | TaskStatus::RolledBack => {
            style(text).yellow()
        }
        TaskStatus::Running => style(text).cyan(),
        TaskStatus::Pending => style(text).dim(),
    }
}

fn styled_run(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => style(text).green(),
        RunStatus::Failed => style(text).red(),
        RunStatus::Skipped | RunStatus::RolledBackFrom => style(text).dim(),
        RunStatus::Interrupted => style(text).yellow(),
        RunStatus::Pending | RunStatus::Running => style(text).cyan(),
    }
}

pub fn cmd_list(cli: &Cli, project_dir: PathBuf, all: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = stagehand::task::TaskStore::from_config(&config);
    let tasks = store.list(all)?;

    if tasks.is_empty() {
        println!();
        println!("No tasks. Run 'stagehand start <name> --type <type>' to create one.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<32} {:<10} {:<18} {:<10} Updated",
        "Task", "Type", "Status", "Stage"
    );
    println!(
        "{:<32} {:<10} {:<18} {:<10} -------",
        "-".repeat(32),
        "-".repeat(10),
        "-".repeat(18),
        "-".repeat(10)
    );
    for task in &tasks {
        println!(
            "{:<32} {:<10} {:<18} {:<10} {}",
            task.id,
            task.task_type.to_string(),
            styled_status(task.status),
            task.current_stage.as_deref().unwrap_or("-"),
            task.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_status(cli: &Cli, project_dir: PathBuf, id: &str) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let store = stagehand::task::TaskStore::from_config(&config);
    let task = store.load(id)?;
    print_status(&task);
    Ok(())
}

fn print_status(task: &Task) {
    println!();
    println!("{} {}", style("Task").bold(), style(&task.id).cyan());
    println!("  Name:    {}", task.name);
    println!("  Type:    {}", task.task_type);
    println!("  Branch:  {}", task.branch);
    println!("  Status:  {}", styled_status(task.status));
    if let Some(ref reason) = task.status_reason {
        println!("  Reason:  {}", reason);
    }
    println!(
        "  Stage:   {}",
        task.current_stage.as_deref().unwrap_or("-")
    );
    println!("  Artifacts: {}", task.artifact_dir.display());
    println!();

    if task.history.is_empty() {
        println!("No stages have run yet.");
    } else {
        println!("{:<10} {:>7} {:<18} {:>8} Note", "Stage", "Attempt", "Result", "Time");
        for run in &task.history {
            let elapsed = run
                .duration()
                .map(|d| format!("{}s", d.num_seconds()))
                .unwrap_or_else(|| "-".to_string());
            let note = run
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .or_else(|| run.note.clone())
                .unwrap_or_default();
            println!(
                "{:<10} {:>7} {:<18} {:>8} {}",
                run.stage,
                run.attempt,
                styled_run(run.status),
                elapsed,
                style(note).dim()
            );
        }
    }

    if !task.rollback_log.is_empty() {
        println!();
        println!("Rollbacks:");
        for rollback in &task.rollback_log {
            println!(
                "  {} {} -> {}{}",
                rollback.at.format("%H:%M:%S"),
                rollback.from,
                rollback.target,
                if rollback.fast_track { " (fast-track)" } else { "" }
            );
        }
    }

    if task.status == TaskStatus::WaitingApproval {
        println!();
        println!(
            "Waiting for approval: `stagehand approve {id}` or `stagehand reject {id} --reason ...`",
            id = task.id
        );
    }
    println!();
}
