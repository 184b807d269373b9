//! Approval gates.
//!
//! A gated stage that succeeds is not settled. The task waits in `waiting_approval`
//! until an approve or reject decision arrives. Approval settles the stage and moves
//! on; rejection invalidates the run and the same stage runs again with the
//! rejection feedback as context.

use anyhow::{Result, bail};
use tracing::info;

use crate::errors::StageError;
use crate::resolver::ResolvedSequence;
use crate::task::{RunStatus, Task, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    Rejected { feedback: String },
}

/// Suspend the task at its current stage pending a decision.
pub fn hold(task: &mut Task, stage: &str) {
    task.current_stage = Some(stage.to_string());
    task.set_status(
        TaskStatus::WaitingApproval,
        Some(format!("{} awaiting approval", stage)),
    );
    info!(task = %task.id, stage, "Waiting for approval");
}

fn gated_stage(task: &Task) -> Result<String> {
    if task.status != TaskStatus::WaitingApproval {
        bail!("Task {} is {}, not waiting for approval", task.id, task.status);
    }
    task.current_stage
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Task {} has no current stage", task.id))
}

/// Apply a decision. Returns the stage it applied to.
///
/// On approval the caller advances the cursor; on rejection the cursor stays.
pub fn decide(task: &mut Task, decision: &GateDecision) -> Result<String> {
    let stage = gated_stage(task)?;
    match decision {
        GateDecision::Approved => {
            task.counter_mut(&stage).settle();
            task.set_status(TaskStatus::Running, None);
            info!(task = %task.id, stage = %stage, "Approved");
        }
        GateDecision::Rejected { feedback } => {
            if let Some(run) = task
                .history
                .iter_mut()
                .rev()
                .find(|r| r.stage == stage)
                && run.status == RunStatus::Succeeded
            {
                run.status = RunStatus::RolledBackFrom;
            }
            let err = StageError::ApprovalRejected {
                feedback: feedback.clone(),
            };
            task.push_context(&format!("{} for {}. Revise accordingly.", err, stage));
            task.set_status(
                TaskStatus::RolledBack,
                Some(format!("{} rejected", stage)),
            );
            info!(task = %task.id, stage = %stage, "Rejected");
        }
    }
    Ok(stage)
}

/// Move the cursor past `stage`. `None` means the sequence is finished.
pub fn advance(task: &mut Task, seq: &ResolvedSequence, stage: &str) -> Option<String> {
    task.counter_mut(stage).settle();
    if task.operator_override.as_deref() == Some(stage) {
        task.operator_override = None;
    }
    let next = seq.next_after(stage).map(|s| s.name().to_string());
    task.current_stage = next.clone();
    next
}
