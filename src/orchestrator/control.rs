//! Operator control signals.
//!
//! Signals reach a running orchestrator two ways: in-process through a
//! [`ControlHandle`], or from another process by appending JSON lines to
//! `<task>/control.json`, which the [`ControlReceiver`] polls.
//!
//! The runner always quiesces the stage executor before calling any `apply_*`
//! function here, so these only ever see a task with at most one open run that
//! nothing else is touching.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::policy::{RollbackSource, apply_rollback};
use crate::errors::StageError;
use crate::executor::payload::truncate_head;
use crate::resolver::ResolvedSequence;
use crate::stage::IMPLEMENTATION_STAGE;
use crate::task::{FailureRecord, RunStatus, Task, TaskStatus};
use crate::validation::truncate_output;

pub const CONTROL_FILE: &str = "control.json";

/// How often the control file is checked.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Longest tail of interrupted output carried as context.
const PARTIAL_OUTPUT_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    Interrupt {
        #[serde(default)]
        feedback: Option<String>,
    },
    Skip,
    Back,
    Pause,
    Edit,
    Approve,
    Reject {
        feedback: String,
    },
    /// Lift a stage-plan skip recommendation for `stage`
    Unskip {
        stage: String,
    },
    Abandon,
}

impl ControlSignal {
    /// Signals that cancel a running stage. Gate decisions only apply while waiting,
    /// and an unskip only affects stages not yet reached.
    pub fn preempts(&self) -> bool {
        !matches!(
            self,
            ControlSignal::Approve | ControlSignal::Reject { .. } | ControlSignal::Unskip { .. }
        )
    }
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlSignal::Interrupt { .. } => "interrupt",
            ControlSignal::Skip => "skip",
            ControlSignal::Back => "back",
            ControlSignal::Pause => "pause",
            ControlSignal::Edit => "edit",
            ControlSignal::Approve => "approve",
            ControlSignal::Reject { .. } => "reject",
            ControlSignal::Unskip { .. } => "unskip",
            ControlSignal::Abandon => "abandon",
        };
        write!(f, "{}", s)
    }
}

/// Sending half, cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlSignal>,
}

impl ControlHandle {
    /// Returns false when the orchestrator has already stopped listening.
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// Receiving half owned by the runner.
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<ControlSignal>,
    channel_open: bool,
    control_file: PathBuf,
    queued: std::collections::VecDeque<ControlSignal>,
}

/// Create a control channel for the task whose directory is `task_dir`.
pub fn channel(task_dir: &Path) -> (ControlHandle, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ControlHandle { tx },
        ControlReceiver {
            rx,
            channel_open: true,
            control_file: task_dir.join(CONTROL_FILE),
            queued: Default::default(),
        },
    )
}

/// Append a signal to a task's control file, for a running orchestrator to pick up.
pub fn write_signal(task_dir: &Path, signal: &ControlSignal) -> Result<()> {
    let path = task_dir.join(CONTROL_FILE);
    let line = serde_json::to_string(signal).context("Failed to serialize signal")?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", line).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

impl ControlReceiver {
    /// Take every signal written to the control file since the last check.
    fn drain_file(&mut self) {
        if !self.control_file.exists() {
            return;
        }
        let taken = self.control_file.with_extension("json.taken");
        if let Err(e) = std::fs::rename(&self.control_file, &taken) {
            warn!(error = %e, "Failed to take control file");
            return;
        }
        let content = match std::fs::read_to_string(&taken) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "Failed to read control file");
                return;
            }
        };
        let _ = std::fs::remove_file(&taken);
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ControlSignal>(line) {
                Ok(signal) => self.queued.push_back(signal),
                Err(e) => warn!(line, error = %e, "Ignoring malformed control signal"),
            }
        }
    }

    /// Put a signal back at the head of the queue.
    pub fn requeue(&mut self, signal: ControlSignal) {
        self.queued.push_front(signal);
    }

    /// Next signal if one is already pending.
    pub fn try_recv(&mut self) -> Option<ControlSignal> {
        if let Some(signal) = self.queued.pop_front() {
            return Some(signal);
        }
        if self.channel_open {
            match self.rx.try_recv() {
                Ok(signal) => return Some(signal),
                Err(mpsc::error::TryRecvError::Disconnected) => self.channel_open = false,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
        }
        self.drain_file();
        self.queued.pop_front()
    }

    /// Wait for the next signal. Never returns while no signal arrives.
    pub async fn recv(&mut self) -> ControlSignal {
        loop {
            if let Some(signal) = self.try_recv() {
                return signal;
            }
            if self.channel_open {
                tokio::select! {
                    msg = self.rx.recv() => match msg {
                        Some(signal) => return signal,
                        None => self.channel_open = false,
                    },
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            } else {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

fn partial_context(partial_output: &str) -> String {
    if partial_output.trim().is_empty() {
        String::new()
    } else {
        format!(
            "\n\nOutput before the interruption:\n{}",
            truncate_output(partial_output.trim(), PARTIAL_OUTPUT_CHARS)
        )
    }
}

/// Close the open run, if any, as interrupted.
fn close_interrupted(task: &mut Task, note: &str) -> Result<Option<String>> {
    let Some(stage) = task.active_run().map(|r| r.stage.clone()) else {
        return Ok(None);
    };
    task.close_active(
        RunStatus::Interrupted,
        Some(FailureRecord::from(&StageError::Interrupted)),
        Some(note.to_string()),
    )?;
    Ok(Some(stage))
}

/// Interrupt: the active run closes as interrupted and work resumes at the
/// implementation stage if it is at or before the current one, else at the current
/// stage. Either way the next run carries the operator's feedback and the partial
/// output. Not counted as a failure.
pub fn apply_interrupt(
    task: &mut Task,
    seq: &ResolvedSequence,
    partial_output: &str,
    feedback: Option<&str>,
) -> Result<()> {
    let current = match close_interrupted(task, "interrupted by operator")? {
        Some(stage) => stage,
        None => match task.current_stage.clone() {
            Some(stage) => stage,
            None => return Ok(()),
        },
    };

    let issues = format!(
        "Operator feedback: {}{}",
        feedback.unwrap_or("(none)"),
        partial_context(partial_output)
    );

    let dev_pos = seq.position(IMPLEMENTATION_STAGE);
    let cur_pos = seq.position(&current);
    match (dev_pos, cur_pos) {
        (Some(dev), Some(cur)) if dev < cur => {
            apply_rollback(
                task,
                seq,
                &current,
                IMPLEMENTATION_STAGE,
                RollbackSource::Operator,
                &issues,
            )?;
        }
        _ => {
            task.push_context(&format!("OPERATOR INTERRUPT on {}. {}", current, issues));
            task.current_stage = Some(current.clone());
            task.set_status(TaskStatus::Running, None);
        }
    }
    info!(task = %task.id, stage = %current, "Interrupt applied");
    Ok(())
}

/// Skip: the current stage closes as skipped without a result and the cursor advances.
/// Returns the next stage, `None` when the sequence is finished.
pub fn apply_skip(task: &mut Task, seq: &ResolvedSequence) -> Result<Option<String>> {
    let Some(current) = task.current_stage.clone() else {
        return Ok(None);
    };
    if task.active_run().is_some() {
        task.close_active(
            RunStatus::Skipped,
            None,
            Some("skipped by operator".to_string()),
        )?;
    } else {
        task.record_skip(&current, "skipped by operator".to_string());
    }
    let next = super::gate::advance(task, seq, &current);
    task.set_status(TaskStatus::Running, None);
    info!(task = %task.id, stage = %current, next = ?next, "Skip applied");
    Ok(next)
}

/// Back: the cursor moves to the preceding runnable stage, which then runs even if a
/// soft skip would apply.
pub fn apply_back(task: &mut Task, seq: &ResolvedSequence, partial_output: &str) -> Result<()> {
    let Some(current) = task.current_stage.clone() else {
        return Ok(());
    };
    close_interrupted(task, "operator moved back")?;

    let previous = seq.previous_before(&current).map(|s| s.name().to_string());

    let Some(previous) = previous else {
        debug!(task = %task.id, stage = %current, "Back at the first stage; staying");
        task.set_status(TaskStatus::Running, None);
        return Ok(());
    };

    task.counter_mut(&previous).reopen();
    task.attempts.remove(&current);
    task.operator_override = Some(previous.clone());
    task.current_stage = Some(previous.clone());
    let partial = partial_context(partial_output);
    if !partial.is_empty() {
        task.push_context(&format!("Operator moved back from {}.{}", current, partial));
    }
    task.set_status(TaskStatus::Running, None);
    info!(task = %task.id, from = %current, to = %previous, "Back applied");
    Ok(())
}

/// Unskip: a stage the stage plan recommends skipping runs when the cursor reaches it.
/// Configuration skips are hard removals and stay. Returns whether anything changed.
pub fn apply_unskip(task: &mut Task, seq: &ResolvedSequence, stage: &str) -> bool {
    let Some(resolved) = seq.get(stage) else {
        warn!(task = %task.id, stage, "Unskip for a stage outside the workflow; ignoring");
        return false;
    };
    if let Some(ref rule) = resolved.hard_skip {
        warn!(task = %task.id, stage, source = %rule.source, "Stage is removed by configuration; cannot unskip");
        return false;
    }
    if !task.lifted_skips.insert(stage.to_string()) {
        return false;
    }
    info!(task = %task.id, stage, "Stage plan skip lifted");
    true
}

/// Pause or Edit: the active run closes as interrupted and the task suspends at the
/// same stage until resumed.
pub fn apply_pause(task: &mut Task, partial_output: &str, edit: bool) -> Result<()> {
    let note = if edit {
        "suspended for manual edits"
    } else {
        "paused by operator"
    };
    if let Some(stage) = close_interrupted(task, note)? {
        task.current_stage = Some(stage);
    }
    let partial = partial_context(partial_output);
    if edit {
        task.push_context(&format!(
            "The operator made manual changes while the task was suspended. Review the \
             working tree before continuing.{}",
            partial
        ));
    } else if !partial.is_empty() {
        task.push_context(&format!("The previous run was paused.{}", partial));
    }
    let reason = if edit { "edit" } else { "paused by operator" };
    task.set_status(TaskStatus::Paused, Some(reason.to_string()));
    info!(task = %task.id, stage = ?task.current_stage, reason, "Suspended");
    Ok(())
}

/// Abandon: close any open run and mark the task abandoned.
pub fn apply_abandon(task: &mut Task, reason: &str) -> Result<()> {
    close_interrupted(task, "task abandoned")?;
    task.set_status(
        TaskStatus::Abandoned,
        Some(truncate_head(reason, 200)),
    );
    Ok(())
}
