//! Operator decisions and signals: `stagehand approve`, `reject`, `signal`, `abandon`.
//!
//! A task driven by another process receives the signal through its control file.
//! Otherwise the signal is applied to the record here and the task waits for `resume`.

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;

use super::super::{Cli, SignalKind};
use super::{load_config, orchestrator};
use stagehand::orchestrator::{ControlSignal, Delivery, Orchestrator};
use stagehand::task::TaskStatus;

async fn send(orch: Orchestrator, id: &str, signal: ControlSignal) -> Result<()> {
    let label = signal.to_string();
    let result = orch.deliver(id, signal);
    orch.shutdown().await;
    match result? {
        Delivery::Queued => {
            println!(
                "{} {} sent to the running orchestrator for {}",
                style("→").cyan(),
                label,
                id
            );
        }
        Delivery::Applied => {
            println!("{} {} applied to {}", style("✓").green(), label, id);
        }
    }
    Ok(())
}

fn require_waiting(orch: &Orchestrator, id: &str) -> Result<()> {
    let task = orch.store().load(id)?;
    if task.status != TaskStatus::WaitingApproval {
        bail!("Task {} is {}, not waiting for approval", task.id, task.status);
    }
    Ok(())
}

pub async fn cmd_approve(cli: &Cli, project_dir: PathBuf, id: &str) -> Result<()> {
    let orch = orchestrator(load_config(cli, project_dir)?);
    require_waiting(&orch, id)?;
    send(orch, id, ControlSignal::Approve).await
}

pub async fn cmd_reject(cli: &Cli, project_dir: PathBuf, id: &str, reason: &str) -> Result<()> {
    if reason.trim().is_empty() {
        bail!("A rejection needs a reason; it becomes the stage's feedback");
    }
    let orch = orchestrator(load_config(cli, project_dir)?);
    require_waiting(&orch, id)?;
    send(
        orch,
        id,
        ControlSignal::Reject {
            feedback: reason.to_string(),
        },
    )
    .await
}

pub async fn cmd_signal(
    cli: &Cli,
    project_dir: PathBuf,
    id: &str,
    kind: SignalKind,
    feedback: Option<String>,
) -> Result<()> {
    if feedback.is_some() && !matches!(kind, SignalKind::Interrupt) {
        bail!("--feedback only applies to interrupt");
    }
    let signal = match kind {
        SignalKind::Interrupt => ControlSignal::Interrupt { feedback },
        SignalKind::Skip => ControlSignal::Skip,
        SignalKind::Back => ControlSignal::Back,
        SignalKind::Pause => ControlSignal::Pause,
        SignalKind::Edit => ControlSignal::Edit,
    };
    let orch = orchestrator(load_config(cli, project_dir)?);
    let task = orch.store().load(id)?;
    if task.status.is_terminal() {
        bail!("Task {} is already {}", task.id, task.status);
    }
    send(orch, id, signal).await
}

pub async fn cmd_unskip(cli: &Cli, project_dir: PathBuf, id: &str, stage: &str) -> Result<()> {
    let stage = stage.to_uppercase();
    let orch = orchestrator(load_config(cli, project_dir)?);
    let task = orch.store().load(id)?;
    if task.status.is_terminal() {
        bail!("Task {} is already {}", task.id, task.status);
    }
    let seq = orch.sequence(&task)?;
    match seq.get(&stage) {
        None => bail!("Stage {} is not part of task {}'s workflow", stage, task.id),
        Some(resolved) if resolved.hard_skip.is_some() => {
            bail!("Stage {} is skipped by configuration (stages.skip)", stage)
        }
        Some(_) => {}
    }
    send(orch, id, ControlSignal::Unskip { stage }).await
}

pub async fn cmd_abandon(cli: &Cli, project_dir: PathBuf, id: &str, yes: bool) -> Result<()> {
    use dialoguer::Confirm;

    let orch = orchestrator(load_config(cli, project_dir)?);
    let task = orch.store().load(id)?;
    if task.status.is_terminal() {
        bail!("Task {} is already {}", task.id, task.status);
    }

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!("Abandon task {}? This cannot be undone.", task.id))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Abandon cancelled");
            return Ok(());
        }
    }

    let result = orch.abandon(id);
    orch.shutdown().await;
    match result? {
        Delivery::Queued => println!(
            "{} abandon sent to the running orchestrator for {}",
            style("→").cyan(),
            id
        ),
        Delivery::Applied => println!("{} Task {} abandoned and archived", style("✗").red(), id),
    }
    Ok(())
}
