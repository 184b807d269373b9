//! Retry and rollback policy.
//!
//! On a failed run the stage's consecutive-failure count for the current episode goes
//! up by one. While it stays within the stage's retry limit the same stage runs again
//! with the failure attached as context. Past the limit the task rolls back to the
//! stage's rollback target; with no target left the task fails.
//!
//! A rollback:
//! - reopens the target and resets the counters of every later stage up to the failing one
//! - marks their latest closed runs `rolled_back_from`
//! - appends an entry to `ROLLBACK.md`
//!
//! Fast-track rollbacks (minor-changes verdicts) do the same but leave stages that
//! already succeeded between target and failing stage alone; they are skipped on the
//! way back up.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::artifacts::{RollbackEntry, append_rollback_entry};
use crate::errors::StageError;
use crate::executor::payload::truncate_head;
use crate::resolver::ResolvedSequence;
use crate::task::{FastTrack, RollbackRecord, RunStatus, Task, TaskStatus};

/// What to do after a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { failures: u32 },
    Rollback { target: String },
    /// A human has to decide; the task pauses
    Escalate { reason: String },
    /// No recovery path left
    Fail { reason: String },
}

/// Retry limit for `stage`: the stage's own override, else `stages.max_retries`.
pub fn max_retries_for(task: &Task, seq: &ResolvedSequence, stage: &str) -> u32 {
    seq.get(stage)
        .and_then(|s| s.spec.max_retries)
        .unwrap_or(task.config.stages.max_retries)
}

/// Rollbacks to `target` within the last hour.
pub fn recent_rollbacks_to(task: &Task, target: &str) -> usize {
    let since = Utc::now() - ChronoDuration::hours(1);
    task.rollback_log
        .iter()
        .filter(|r| r.target == target && r.at > since)
        .count()
}

/// Rollback target for `failing`, or an escalation when the loop limit is reached.
fn checked_target(task: &Task, seq: &ResolvedSequence, failing: &str) -> Result<Option<String>, String> {
    let Some(target) = seq.rollback_target_for(failing) else {
        return Ok(None);
    };
    let limit = task.config.stages.max_rollbacks_per_hour as usize;
    let recent = recent_rollbacks_to(task, &target);
    if recent >= limit {
        return Err(format!(
            "RollbackLoop: {} rollbacks to {} in the last hour (limit {})",
            recent, target, limit
        ));
    }
    Ok(Some(target))
}

/// Decide how to recover from a failed run of `stage` and record the failure.
///
/// `direct` skips in-place retries (fail-marker verdicts).
pub fn on_failure(
    task: &mut Task,
    seq: &ResolvedSequence,
    stage: &str,
    error: &StageError,
    direct: bool,
) -> FailureDecision {
    if error.requires_manual_decision() {
        return FailureDecision::Escalate {
            reason: format!("{} needs a manual decision: {}", stage, error),
        };
    }

    let max_retries = max_retries_for(task, seq, stage);
    let failures = task.counter_mut(stage).record_failure();

    if !direct && failures <= max_retries {
        info!(task = %task.id, stage, failures, max_retries, "Retrying stage");
        return FailureDecision::Retry { failures };
    }

    match checked_target(task, seq, stage) {
        Ok(Some(target)) => FailureDecision::Rollback { target },
        Ok(None) => FailureDecision::Fail {
            reason: StageError::MaxRetriesExceeded {
                stage: stage.to_string(),
                max_retries,
            }
            .to_string()
                + "; no earlier stage to roll back to",
        },
        Err(reason) => FailureDecision::Escalate { reason },
    }
}

/// Context attached to an in-place retry.
pub fn retry_context(stage: &str, failures: u32, error: &StageError, detail: &str) -> String {
    let mut text = format!(
        "RETRY: {} failed (consecutive failure {}): {}",
        stage, failures, error
    );
    if !detail.trim().is_empty() {
        text.push_str("\n\n");
        text.push_str(detail.trim());
    }
    text
}

/// Fast-track target for a minor-changes verdict; `Ok(None)` when there is no
/// earlier stage.
pub fn fast_track_target(
    task: &Task,
    seq: &ResolvedSequence,
    stage: &str,
) -> Result<Option<String>, String> {
    checked_target(task, seq, stage)
}

/// How a rollback was triggered, for the rollback log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackSource {
    Validation,
    Review,
    FastTrack,
    Operator,
}

impl RollbackSource {
    fn title(&self) -> &'static str {
        match self {
            RollbackSource::Validation => "Validation failure",
            RollbackSource::Review => "Review verdict",
            RollbackSource::FastTrack => "Fast-track (minor changes)",
            RollbackSource::Operator => "Operator interrupt",
        }
    }
}

/// Apply a rollback from `failing` to `target`. Returns the attempt number the target
/// will run as.
pub fn apply_rollback(
    task: &mut Task,
    seq: &ResolvedSequence,
    failing: &str,
    target: &str,
    source: RollbackSource,
    issues: &str,
) -> Result<u32> {
    let span = seq.span(target, failing);
    if span.is_empty() {
        anyhow::bail!("{} is not before {} in the resolved sequence", target, failing);
    }
    let fast_track = source == RollbackSource::FastTrack;

    // Stages strictly between target and failing stage whose latest run succeeded.
    let skippable: Vec<String> = if fast_track {
        span.iter()
            .skip(1)
            .take(span.len().saturating_sub(2))
            .filter(|s| {
                task.last_run_of(s)
                    .is_some_and(|r| r.status == RunStatus::Succeeded)
            })
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    for stage in &span {
        if skippable.contains(stage) {
            continue;
        }
        if let Some(run) = task
            .history
            .iter_mut()
            .rev()
            .find(|r| &r.stage == stage)
            && matches!(run.status, RunStatus::Succeeded | RunStatus::Skipped)
        {
            run.status = RunStatus::RolledBackFrom;
        }
        if stage != target {
            task.attempts.remove(stage);
        }
    }
    task.counter_mut(target).reopen();
    let target_attempt = task.counter(target).runs + 1;

    let now = Utc::now();
    append_rollback_entry(
        &task.artifact_dir,
        &RollbackEntry {
            source: source.title(),
            from_stage: failing,
            target_stage: target,
            issues,
            target_attempt,
            at: now,
        },
    )?;

    task.rollback_log.push(RollbackRecord {
        from: failing.to_string(),
        target: target.to_string(),
        at: now,
        reason: truncate_head(issues, 200),
        fast_track,
    });
    task.fast_track = fast_track.then(|| FastTrack {
        target: target.to_string(),
        failing_stage: failing.to_string(),
        skippable: skippable.clone(),
    });

    task.push_context(&format!(
        "ROLLBACK from {} ({}). Fix these issues:\n{}",
        failing,
        source.title(),
        truncate_head(issues.trim(), crate::executor::payload::MAX_RETRY_CONTEXT_CHARS)
    ));
    task.current_stage = Some(target.to_string());
    task.set_status(
        TaskStatus::RolledBack,
        Some(format!("rolled back from {} to {}", failing, target)),
    );

    if fast_track {
        info!(task = %task.id, from = failing, target, skippable = ?skippable, "Fast-track rollback");
    } else {
        warn!(task = %task.id, from = failing, target, target_attempt, "Rolled back");
    }
    Ok(target_attempt)
}

/// Whether the active fast-track window lets `stage` be skipped.
pub fn fast_track_skips(task: &Task, stage: &str) -> bool {
    task.fast_track
        .as_ref()
        .is_some_and(|ft| ft.skippable.iter().any(|s| s == stage))
}

/// Close the fast-track window once its failing stage succeeds.
pub fn close_fast_track_if_done(task: &mut Task, stage: &str) {
    if task
        .fast_track
        .as_ref()
        .is_some_and(|ft| ft.failing_stage == stage)
    {
        task.fast_track = None;
    }
}
