//! The workflow loop.
//!
//! One call to [`Orchestrator::run`] drives one task until it completes, fails, pauses
//! or is abandoned. Each step re-resolves the stage sequence (the stage plan can change
//! while the task runs), decides the current stage against the changed-file set of
//! that moment, runs it on a spawned executor and hands the outcome to the policy.
//!
//! Control signals race the executor. A signal cancels the executor and waits for it
//! to finish before anything touches the task record, and a signal that arrives
//! together with a completion wins: the completion is discarded.

use anyhow::{Context, Result, bail};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::{self, ControlHandle, ControlReceiver, ControlSignal};
use super::gate::{self, GateDecision};
use super::policy::{self, FailureDecision, RollbackSource};
use crate::artifacts::{archive_rollback, read_artifact, snapshot, write_skip_artifact};
use crate::config::Config;
use crate::errors::{StageError, StoreError};
use crate::events::{EventKind, EventPublisher};
use crate::executor::payload::truncate_head;
use crate::executor::{self, StageJob, StageOutcome, StageResult};
use crate::resolver::{
    PlanEntry, ResolvedSequence, ResolvedStage, SkipSource, StageDecision, StagePlan, resolve,
};
use crate::stage::{IMPLEMENTATION_STAGE, TaskType, template_for};
use crate::task::{FailureRecord, RunStatus, Task, TaskStatus, TaskStore};
use crate::tracker::{self, ChangeSource, GitTracker};

/// How a call to [`Orchestrator::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    Failed,
    /// Paused, escalated, or suspended for edits; `resume` continues
    Paused,
    /// Stopped at an approval gate without waiting for the decision
    AwaitingApproval,
    Abandoned,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Complete => "complete",
            RunOutcome::Failed => "failed",
            RunOutcome::Paused => "paused",
            RunOutcome::AwaitingApproval => "waiting for approval",
            RunOutcome::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Where a signal sent with [`Orchestrator::deliver`] ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Applied directly to the task record
    Applied,
    /// Another process drives the task; queued in its control file
    Queued,
}

pub struct Orchestrator {
    config: Config,
    store: TaskStore,
    events: EventPublisher,
    changes: Option<Arc<dyn ChangeSource>>,
    wait_at_gates: bool,
}

impl Orchestrator {
    pub fn new(config: Config, events: EventPublisher) -> Self {
        Self {
            store: TaskStore::from_config(&config),
            config,
            events,
            changes: None,
            wait_at_gates: true,
        }
    }

    /// Return [`RunOutcome::AwaitingApproval`] at a gate instead of waiting for a signal.
    pub fn detach_at_gates(mut self) -> Self {
        self.wait_at_gates = false;
        self
    }

    /// Use a fixed change source instead of the project's git working tree.
    pub fn with_change_source(mut self, changes: Arc<dyn ChangeSource>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the orchestrator, giving queued events a moment to drain.
    pub async fn shutdown(self) {
        self.events.shutdown(Duration::from_secs(2)).await;
    }

    /// Create and persist a new task. `plan` holds caller-supplied stage recommendations.
    pub fn create_task(
        &self,
        name: &str,
        task_type: TaskType,
        description: &str,
        plan: Vec<PlanEntry>,
    ) -> Result<Task> {
        let workflow = self.config.workflow.clone();
        let template = template_for(task_type, &workflow)
            .with_context(|| format!("Invalid workflow for task type {}", task_type))?;
        let seq = resolve(&template, &workflow, &StagePlan::new(plan.clone()));
        let first = seq.first().map(|s| s.name().to_string());
        if first.is_none() {
            bail!("The {} workflow has no stages", task_type);
        }

        let mut task = Task::new(name, task_type, description, workflow, first);
        task.stage_plan = plan;
        task.base_commit = GitTracker::head_sha(&self.config.project_dir);
        Ok(self.store.create(task)?)
    }

    /// Control channel for a task this process is about to run.
    pub fn control_channel(&self, task_id: &str) -> (ControlHandle, ControlReceiver) {
        control::channel(&self.store.task_dir(task_id))
    }

    /// Deliver a signal: queued for the running orchestrator when the task is locked,
    /// otherwise applied to the record directly.
    pub fn deliver(&self, task_id: &str, signal: ControlSignal) -> Result<Delivery> {
        let lock = match self.store.lock(task_id) {
            Ok(lock) => lock,
            Err(StoreError::Locked { .. }) => {
                control::write_signal(&self.store.task_dir(task_id), &signal)?;
                info!(task = %task_id, %signal, "Signal queued for running orchestrator");
                return Ok(Delivery::Queued);
            }
            Err(e) => return Err(e.into()),
        };

        let mut task = self.store.load_for_resume(task_id)?;
        if task.status.is_terminal() {
            bail!("Task {} is already {}", task.id, task.status);
        }
        self.handle_idle_signal(&mut task, signal)?;
        if task.status == TaskStatus::Running {
            task.set_status(TaskStatus::Paused, Some("ready to resume".to_string()));
        }
        self.save(&task)?;
        drop(lock);
        Ok(Delivery::Applied)
    }

    fn save(&self, task: &Task) -> Result<()> {
        self.store.save(task)?;
        Ok(())
    }

    fn publish(&self, kind: EventKind, task: &Task, stage: Option<&str>, payload: serde_json::Value) {
        self.events.publish(kind, &task.name, stage, payload);
    }

    fn publish_state(&self, task: &Task) {
        self.publish(
            EventKind::StateUpdate,
            task,
            task.current_stage.as_deref(),
            json!({
                "task_id": task.id,
                "status": task.status.to_string(),
                "reason": task.status_reason,
            }),
        );
    }

    /// Resolve the current stage sequence for `task`.
    pub fn sequence(&self, task: &Task) -> Result<ResolvedSequence> {
        let template = template_for(task.task_type, &task.config)?;
        let artifact_plan = StagePlan::load(&task.artifact_dir).unwrap_or_else(|e| {
            warn!(task = %task.id, error = %e, "Ignoring unreadable stage plan");
            StagePlan::default()
        });
        let plan = StagePlan::merged(&task.stage_plan, artifact_plan);
        Ok(resolve(&template, &task.config, &plan))
    }

    fn change_source(&self, task: &Task) -> Arc<dyn ChangeSource> {
        match self.changes {
            Some(ref changes) => Arc::clone(changes),
            None => Arc::from(tracker::detect(
                &self.config.project_dir,
                task.base_commit.clone(),
            )),
        }
    }

    /// Decide whether `resolved` runs now. The changed-file set is only computed for
    /// stages whose decision depends on it.
    fn decide(&self, task: &Task, resolved: &ResolvedStage) -> Result<StageDecision> {
        let name = resolved.name();
        if task.operator_override.as_deref() == Some(name) {
            return Ok(StageDecision::Run {
                note: Some("operator moved back to this stage".to_string()),
            });
        }
        let needs_changes = resolved.hard_skip.is_none()
            && resolved.spec.skip_if.is_some()
            && !resolved.spec.required;
        let decision = if !needs_changes {
            resolved.decide(&[])?
        } else {
            match self.change_source(task).changed_files() {
                Ok(files) => {
                    debug!(task = %task.id, stage = name, changed = files.len(), "Evaluating file-diff condition");
                    resolved.decide(&files)?
                }
                Err(e) => {
                    warn!(task = %task.id, stage = name, error = %e, "Changed files unavailable; running stage");
                    return Ok(StageDecision::Run {
                        note: Some(format!("changed files unavailable ({}); ran anyway", e)),
                    });
                }
            }
        };
        Ok(match decision {
            StageDecision::Skip { rule, note }
                if rule.source == SkipSource::DynamicRecommendation
                    && task.lifted_skips.contains(name) =>
            {
                let lifted = format!("operator lifted stage plan skip ({})", rule.reason);
                StageDecision::Run {
                    note: Some(match note {
                        Some(note) => format!("{}; {}", lifted, note),
                        None => lifted,
                    }),
                }
            }
            other => other,
        })
    }

    /// Drive `task_id` until it completes, fails, pauses or is abandoned.
    pub async fn run(&self, task_id: &str, mut control: ControlReceiver) -> Result<RunOutcome> {
        let _lock = self.store.lock(task_id)?;
        let mut task = self.store.load_for_resume(task_id)?;

        match task.status {
            TaskStatus::Complete => return Ok(RunOutcome::Complete),
            TaskStatus::Failed => return Ok(RunOutcome::Failed),
            TaskStatus::Abandoned => return Ok(RunOutcome::Abandoned),
            TaskStatus::WaitingApproval => {}
            _ => task.set_status(TaskStatus::Running, None),
        }
        self.save(&task)?;

        info!(task = %task.id, task_type = %task.task_type, stage = ?task.current_stage, "Running task");
        self.publish(
            EventKind::Register,
            &task,
            None,
            json!({ "task_id": task.id, "task_type": task.task_type.to_string(), "branch": task.branch }),
        );
        self.publish_state(&task);

        loop {
            if task.status == TaskStatus::WaitingApproval {
                let signal = if self.wait_at_gates {
                    control.recv().await
                } else {
                    match control.try_recv() {
                        Some(signal) => signal,
                        None => return Ok(RunOutcome::AwaitingApproval),
                    }
                };
                if let Some(outcome) = self.apply_idle(&mut task, signal)? {
                    return Ok(outcome);
                }
                continue;
            }
            if let Some(signal) = control.try_recv() {
                if let Some(outcome) = self.apply_idle(&mut task, signal)? {
                    return Ok(outcome);
                }
                continue;
            }

            let seq = self.sequence(&task)?;
            let Some(stage) = task.current_stage.clone() else {
                return self.complete(&mut task);
            };
            let Some(resolved) = seq.get(&stage).cloned() else {
                bail!("Stage {} is not part of task {}'s workflow", stage, task.id);
            };

            if policy::fast_track_skips(&task, &stage) {
                info!(task = %task.id, stage = %stage, "Fast-track: skipping stage that already passed");
                task.record_skip(&stage, "fast-track: passed before the minor-changes rollback".into());
                gate::advance(&mut task, &seq, &stage);
                self.save(&task)?;
                continue;
            }

            let note = match self.decide(&task, &resolved)? {
                StageDecision::Skip { rule, note } => {
                    self.skip_stage(&mut task, &seq, &stage, &rule.reason, rule.source, note)?;
                    continue;
                }
                StageDecision::Run { note } => note,
            };

            if let Some(outcome) = self
                .run_stage(&mut task, &seq, &resolved, note, &mut control)
                .await?
            {
                return Ok(outcome);
            }
        }
    }

    fn skip_stage(
        &self,
        task: &mut Task,
        seq: &ResolvedSequence,
        stage: &str,
        reason: &str,
        source: SkipSource,
        note: Option<String>,
    ) -> Result<()> {
        let text = format!("{} ({})", reason, source);
        info!(task = %task.id, stage, reason = %text, "Skipping stage");
        if let Some(ref note) = note {
            warn!(task = %task.id, stage, "{}", note);
        }
        if matches!(source, SkipSource::FileDiff | SkipSource::DynamicRecommendation) {
            write_skip_artifact(&task.artifact_dir, stage, &text, note.as_deref())?;
        }
        let recorded = match note {
            Some(note) => format!("{}; {}", text, note),
            None => text.clone(),
        };
        task.record_skip(stage, recorded);
        gate::advance(task, seq, stage);
        self.save(task)?;
        self.publish(
            EventKind::StageComplete,
            task,
            Some(stage),
            json!({ "skipped": true, "reason": text }),
        );
        Ok(())
    }

    fn job_for(&self, task: &Task, resolved: &ResolvedStage, attempt: u32) -> StageJob {
        let name = resolved.name();
        let backend = if resolved.spec.is_mechanical() {
            None
        } else {
            task.config.backend_for_stage(name)
        };
        let available_artifacts = snapshot(&task.artifact_dir)
            .map(|files| files.into_keys().collect())
            .unwrap_or_default();
        StageJob {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            task_type: task.task_type,
            task_description: task.description.clone(),
            stage: resolved.spec.clone(),
            attempt,
            context: task.active_run().and_then(|r| r.context.clone()),
            backend,
            validation: task.config.stage_validation(name),
            project_dir: self.config.project_dir.clone(),
            artifact_dir: task.artifact_dir.clone(),
            timeout: task.config.stages.timeout(),
            available_artifacts,
        }
    }

    /// Run one stage and apply its outcome or a pre-empting signal.
    async fn run_stage(
        &self,
        task: &mut Task,
        seq: &ResolvedSequence,
        resolved: &ResolvedStage,
        note: Option<String>,
        control: &mut ControlReceiver,
    ) -> Result<Option<RunOutcome>> {
        let stage = resolved.name().to_string();
        let backend_name = if resolved.spec.is_mechanical() {
            None
        } else {
            task.config.backend_for_stage(&stage).map(|(name, _)| name)
        };

        let attempt = task.begin_run(&stage, backend_name)?;
        if let Some(note) = note {
            info!(task = %task.id, stage = %stage, "{}", note);
            if let Some(run) = task.active_run_mut() {
                run.note = Some(note);
            }
        }
        self.save(task)?;
        info!(task = %task.id, stage = %stage, attempt, "Stage started");
        self.publish(
            EventKind::StageStart,
            task,
            Some(&stage),
            json!({ "attempt": attempt }),
        );

        let job = self.job_for(task, resolved, attempt);
        let token = CancellationToken::new();
        let mut handle = tokio::spawn(executor::execute(job, token.clone()));

        let mut deferred = Vec::new();
        let (signal, joined) = loop {
            tokio::select! {
                biased;
                signal = control.recv() => {
                    if !signal.preempts() {
                        debug!(task = %task.id, stage = %stage, %signal, "Holding gate decision until the stage finishes");
                        deferred.push(signal);
                        continue;
                    }
                    info!(task = %task.id, stage = %stage, %signal, "Signal received; stopping stage");
                    token.cancel();
                    break (Some(signal), (&mut handle).await);
                }
                joined = &mut handle => {
                    let pending = match control.try_recv() {
                        Some(signal) if signal.preempts() => Some(signal),
                        Some(signal) => {
                            control.requeue(signal);
                            None
                        }
                        None => None,
                    };
                    break (pending, joined);
                }
            }
        };
        for held in deferred.into_iter().rev() {
            control.requeue(held);
        }

        let result = joined.unwrap_or_else(|e| StageResult {
            outcome: StageOutcome::Failed {
                error: StageError::Other(anyhow::anyhow!("Stage executor panicked: {}", e)),
                direct_rollback: false,
            },
            artifacts: Default::default(),
            validation: None,
            output: String::new(),
        });

        if let Some(run) = task.active_run_mut() {
            run.artifacts = result.artifacts.clone();
            run.validation = result.validation.clone();
        }

        if let Some(signal) = signal {
            if !matches!(result.outcome, StageOutcome::Cancelled { .. }) {
                debug!(task = %task.id, stage = %stage, "Discarding stage result in favour of signal");
            }
            let partial = match result.outcome {
                StageOutcome::Cancelled { ref partial_output } => partial_output.clone(),
                _ => result.output.clone(),
            };
            return self.apply_signal(task, seq, signal, &partial);
        }

        self.apply_result(task, seq, resolved, result)
    }

    fn apply_result(
        &self,
        task: &mut Task,
        seq: &ResolvedSequence,
        resolved: &ResolvedStage,
        result: StageResult,
    ) -> Result<Option<RunOutcome>> {
        let stage = resolved.name().to_string();
        let detail = failure_detail(&result);

        match result.outcome {
            StageOutcome::Passed { warnings } => {
                self.on_success(task, seq, resolved, &warnings)?;
                Ok(None)
            }
            StageOutcome::Minor { warnings } => {
                let issues = task
                    .config
                    .stage_validation(&stage)
                    .artifact
                    .and_then(|name| read_artifact(&task.artifact_dir, &name).ok().flatten())
                    .map(|text| truncate_head(&text, 2000))
                    .unwrap_or_else(|| "Minor changes requested".to_string());

                match policy::fast_track_target(task, seq, &stage) {
                    Ok(Some(target)) => {
                        task.close_active(
                            RunStatus::Succeeded,
                            None,
                            Some(format!("minor changes requested; fast-track to {}", target)),
                        )?;
                        policy::apply_rollback(task, seq, &stage, &target, RollbackSource::FastTrack, &issues)?;
                        self.save(task)?;
                        self.publish(
                            EventKind::Rollback,
                            task,
                            Some(&stage),
                            json!({ "target": target, "fast_track": true }),
                        );
                        Ok(None)
                    }
                    Ok(None) => {
                        task.push_context(&issues);
                        self.on_success(task, seq, resolved, &warnings)?;
                        Ok(None)
                    }
                    Err(reason) => {
                        task.close_active(RunStatus::Succeeded, None, Some("minor changes requested".into()))?;
                        self.escalate(task, reason)
                    }
                }
            }
            StageOutcome::Failed {
                error,
                direct_rollback,
            } => {
                warn!(task = %task.id, stage = %stage, error = %error, "Stage failed");
                task.close_active(RunStatus::Failed, Some(FailureRecord::from(&error)), None)?;
                self.publish(
                    EventKind::StageFail,
                    task,
                    Some(&stage),
                    json!({ "kind": error.kind(), "message": error.to_string() }),
                );

                match policy::on_failure(task, seq, &stage, &error, direct_rollback) {
                    FailureDecision::Retry { failures } => {
                        task.push_context(&policy::retry_context(&stage, failures, &error, &detail));
                        task.set_status(TaskStatus::Running, None);
                        self.save(task)?;
                        Ok(None)
                    }
                    FailureDecision::Rollback { target } => {
                        let source = if direct_rollback {
                            RollbackSource::Review
                        } else {
                            RollbackSource::Validation
                        };
                        let issues = format!("{} failed: {}\n\n{}", stage, error, detail.trim());
                        let target_attempt =
                            policy::apply_rollback(task, seq, &stage, &target, source, &issues)?;
                        self.save(task)?;
                        self.publish(
                            EventKind::Rollback,
                            task,
                            Some(&stage),
                            json!({ "target": target, "target_attempt": target_attempt, "fast_track": false }),
                        );
                        Ok(None)
                    }
                    FailureDecision::Escalate { reason } => {
                        if !detail.trim().is_empty() {
                            task.push_context(&detail);
                        }
                        self.escalate(task, reason)
                    }
                    FailureDecision::Fail { reason } => {
                        warn!(task = %task.id, stage = %stage, "{}", reason);
                        task.set_status(TaskStatus::Failed, Some(reason.clone()));
                        self.save(task)?;
                        self.publish(
                            EventKind::TaskComplete,
                            task,
                            Some(&stage),
                            json!({ "status": "failed", "reason": reason }),
                        );
                        Ok(Some(RunOutcome::Failed))
                    }
                }
            }
            StageOutcome::Cancelled { partial_output } => {
                // Cancelled without a signal: nothing cancels the executor but the runner.
                control::apply_pause(task, &partial_output, false)?;
                self.save(task)?;
                self.publish_state(task);
                Ok(Some(RunOutcome::Paused))
            }
        }
    }

    fn on_success(
        &self,
        task: &mut Task,
        seq: &ResolvedSequence,
        resolved: &ResolvedStage,
        warnings: &[String],
    ) -> Result<()> {
        let stage = resolved.name().to_string();
        let run = task.close_active(RunStatus::Succeeded, None, None)?;
        let (attempt, artifacts): (u32, Vec<String>) =
            (run.attempt, run.artifacts.keys().cloned().collect());

        if !warnings.is_empty() {
            task.push_context(&format!(
                "Warnings from {}:\n- {}",
                stage,
                warnings.join("\n- ")
            ));
        }
        if stage == IMPLEMENTATION_STAGE && archive_rollback(&task.artifact_dir)? {
            info!(task = %task.id, "Rollback log archived");
        }
        policy::close_fast_track_if_done(task, &stage);
        self.publish(
            EventKind::StageComplete,
            task,
            Some(&stage),
            json!({ "attempt": attempt, "artifacts": artifacts }),
        );

        if resolved.spec.requires_approval {
            gate::hold(task, &stage);
            self.save(task)?;
            self.publish(
                EventKind::ApprovalNeeded,
                task,
                Some(&stage),
                json!({ "attempt": attempt, "artifacts": artifacts }),
            );
            return Ok(());
        }

        gate::advance(task, seq, &stage);
        task.set_status(TaskStatus::Running, None);
        self.save(task)
    }

    fn escalate(&self, task: &mut Task, reason: String) -> Result<Option<RunOutcome>> {
        warn!(task = %task.id, stage = ?task.current_stage, reason = %reason, "Manual decision required");
        task.set_status(TaskStatus::Paused, Some(reason));
        self.save(task)?;
        self.publish_state(task);
        Ok(Some(RunOutcome::Paused))
    }

    fn complete(&self, task: &mut Task) -> Result<RunOutcome> {
        task.current_stage = None;
        task.set_status(TaskStatus::Complete, None);
        self.save(task)?;
        info!(task = %task.id, runs = task.history.len(), "Task complete");
        self.publish(
            EventKind::TaskComplete,
            task,
            None,
            json!({ "status": "complete", "runs": task.history.len() }),
        );
        self.store.archive(task)?;
        Ok(RunOutcome::Complete)
    }

    /// Apply a signal that interrupted a running stage. The executor has finished.
    fn apply_signal(
        &self,
        task: &mut Task,
        seq: &ResolvedSequence,
        signal: ControlSignal,
        partial_output: &str,
    ) -> Result<Option<RunOutcome>> {
        let outcome = match signal {
            ControlSignal::Interrupt { ref feedback } => {
                control::apply_interrupt(task, seq, partial_output, feedback.as_deref())?;
                None
            }
            ControlSignal::Skip => {
                control::apply_skip(task, seq)?;
                None
            }
            ControlSignal::Back => {
                control::apply_back(task, seq, partial_output)?;
                None
            }
            ControlSignal::Pause => {
                control::apply_pause(task, partial_output, false)?;
                Some(RunOutcome::Paused)
            }
            ControlSignal::Edit => {
                control::apply_pause(task, partial_output, true)?;
                Some(RunOutcome::Paused)
            }
            ControlSignal::Abandon => {
                control::apply_abandon(task, "abandoned by operator")?;
                Some(RunOutcome::Abandoned)
            }
            ControlSignal::Approve | ControlSignal::Reject { .. } | ControlSignal::Unskip { .. } => {
                None
            }
        };
        self.finish_signal(task, outcome)
    }

    /// Apply a signal while no stage runs.
    fn apply_idle(&self, task: &mut Task, signal: ControlSignal) -> Result<Option<RunOutcome>> {
        let outcome = self.handle_idle_signal(task, signal)?;
        self.finish_signal(task, outcome)
    }

    fn handle_idle_signal(&self, task: &mut Task, signal: ControlSignal) -> Result<Option<RunOutcome>> {
        let seq = self.sequence(task)?;
        info!(task = %task.id, %signal, "Applying signal");
        match signal {
            ControlSignal::Approve | ControlSignal::Reject { .. }
                if task.status != TaskStatus::WaitingApproval =>
            {
                warn!(task = %task.id, %signal, "Task is not waiting for approval; ignoring");
                Ok(None)
            }
            ControlSignal::Approve => {
                let stage = gate::decide(task, &GateDecision::Approved)?;
                gate::advance(task, &seq, &stage);
                Ok(None)
            }
            ControlSignal::Reject { feedback } => {
                gate::decide(task, &GateDecision::Rejected { feedback })?;
                Ok(None)
            }
            ControlSignal::Unskip { stage } => {
                control::apply_unskip(task, &seq, &stage);
                Ok(None)
            }
            other => {
                if task.status == TaskStatus::WaitingApproval {
                    task.set_status(TaskStatus::Running, None);
                }
                match other {
                    ControlSignal::Interrupt { ref feedback } => {
                        control::apply_interrupt(task, &seq, "", feedback.as_deref())?;
                        Ok(None)
                    }
                    ControlSignal::Skip => {
                        control::apply_skip(task, &seq)?;
                        Ok(None)
                    }
                    ControlSignal::Back => {
                        control::apply_back(task, &seq, "")?;
                        Ok(None)
                    }
                    ControlSignal::Pause => {
                        control::apply_pause(task, "", false)?;
                        Ok(Some(RunOutcome::Paused))
                    }
                    ControlSignal::Edit => {
                        control::apply_pause(task, "", true)?;
                        Ok(Some(RunOutcome::Paused))
                    }
                    ControlSignal::Abandon => {
                        control::apply_abandon(task, "abandoned by operator")?;
                        Ok(Some(RunOutcome::Abandoned))
                    }
                    ControlSignal::Approve
                    | ControlSignal::Reject { .. }
                    | ControlSignal::Unskip { .. } => Ok(None),
                }
            }
        }
    }

    fn finish_signal(&self, task: &mut Task, outcome: Option<RunOutcome>) -> Result<Option<RunOutcome>> {
        self.save(task)?;
        self.publish_state(task);
        if outcome == Some(RunOutcome::Abandoned) {
            self.publish(
                EventKind::TaskComplete,
                task,
                task.current_stage.as_deref(),
                json!({ "status": "abandoned" }),
            );
            self.store.archive(task)?;
        }
        Ok(outcome)
    }

    /// Abandon a task that no process is driving, or queue the signal for the one that is.
    pub fn abandon(&self, task_id: &str) -> Result<Delivery> {
        let delivery = self.deliver(task_id, ControlSignal::Abandon)?;
        if delivery == Delivery::Applied {
            let mut task = self.store.load(task_id)?;
            self.publish(
                EventKind::TaskComplete,
                &task,
                task.current_stage.as_deref(),
                json!({ "status": "abandoned" }),
            );
            self.store.archive(&mut task)?;
        }
        Ok(delivery)
    }
}

/// Failure detail for retry context and the rollback log: the validation summary when
/// there is one, else the tail of the backend output.
fn failure_detail(result: &StageResult) -> String {
    match result.validation {
        Some(ref report) if !report.results.is_empty() => report.summary(),
        _ => crate::validation::truncate_output(
            result.output.trim(),
            crate::executor::payload::MAX_RETRY_CONTEXT_CHARS,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::create_test_script;
    use crate::tracker::StaticChanges;
    use crate::workflow_config::WorkflowToml;
    use tempfile::{TempDir, tempdir};

    /// Reads the payload and reports the stage. DEV's first attempt sleeps so a signal
    /// can catch it mid-run.
    const BACKEND: &str = r#"#!/bin/sh
cat > /dev/null
echo "ran $STAGEHAND_STAGE attempt $STAGEHAND_ATTEMPT"
if [ "$STAGEHAND_STAGE" = "DEV" ] && [ "$STAGEHAND_ATTEMPT" = "1" ] && [ -f "$STAGEHAND_ARTIFACT_DIR/../../slow-dev" ]; then
    echo "working on the fix"
    sleep 30
fi
"#;

    fn orchestrator(dir: &TempDir, toml: &str) -> Orchestrator {
        let script = create_test_script(dir.path(), "backend.sh", BACKEND);
        let content = format!(
            "[ai]\ndefault_backend = \"fake\"\n\n[ai.backends.fake]\ncommand = \"{}\"\n\n{}",
            script.display(),
            toml
        );
        let workflow = WorkflowToml::parse(&content).unwrap();
        let config = Config::with_workflow(dir.path().to_path_buf(), false, workflow);
        Orchestrator::new(config, EventPublisher::disabled())
            .with_change_source(Arc::new(StaticChanges(Vec::new())))
    }

    const UNGATED_PLAN: &str = r#"
[stages.overrides.PLAN]
requires_approval = false
"#;

    fn runs<'a>(task: &'a Task, stage: &str) -> Vec<&'a crate::task::StageRun> {
        task.history.iter().filter(|r| r.stage == stage).collect()
    }

    #[tokio::test]
    async fn test_validation_failure_rolls_back_to_dev_then_completes() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            &format!(
                r#"{}
[stages]
max_retries = 1

[templates]
bug_fix = ["PLAN", "DEV", "TEST", "QA"]

[validation.QA]
commands = [
    {{ name = "qa-suite", command = "n=$(cat qa_count 2>/dev/null || echo 0); n=$((n+1)); echo $n > qa_count; [ $n -ge 3 ]" }},
]
"#,
                UNGATED_PLAN
            ),
        );

        let task = orch
            .create_task("fix login", TaskType::BugFix, "Login fails after reset", Vec::new())
            .unwrap();
        let (_handle, rx) = orch.control_channel(&task.id);
        let outcome = orch.run(&task.id, rx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Complete);

        let task = orch.store().load(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.artifact_dir.ends_with(format!("done/{}", task.id)));

        let qa = runs(&task, "QA");
        assert_eq!(qa.len(), 3);
        assert_eq!(
            qa.iter().filter(|r| r.status == RunStatus::Failed).count(),
            2
        );
        assert_eq!(qa[2].status, RunStatus::Succeeded);

        let dev = runs(&task, "DEV");
        assert_eq!(dev.len(), 2);
        assert_eq!(dev[1].attempt, 2);
        assert!(dev[1].context.as_deref().unwrap().contains("QA failed"));

        assert_eq!(task.rollback_log.len(), 1);
        assert_eq!(task.rollback_log[0].from, "QA");
        assert_eq!(task.rollback_log[0].target, "DEV");

        let resolved =
            std::fs::read_to_string(task.artifact_dir.join(crate::artifacts::ROLLBACK_RESOLVED_FILE))
                .unwrap();
        assert!(resolved.contains("**From Stage:** QA"));
        assert!(resolved.contains("**Target Attempt:** 2"));
        assert!(!task.artifact_dir.join(crate::artifacts::ROLLBACK_FILE).exists());
    }

    #[tokio::test]
    async fn test_retries_exhausted_without_target_fails_task() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            &format!(
                r#"{}
[stages]
max_retries = 1

[templates]
chore = ["PLAN", "DEV"]

[validation.PLAN]
commands = [{{ name = "always-red", command = "exit 1" }}]
"#,
                UNGATED_PLAN
            ),
        );
        let task = orch
            .create_task("bump deps", TaskType::Chore, "", Vec::new())
            .unwrap();
        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Failed);

        let task = orch.store().load(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(runs(&task, "PLAN").len(), 2);
        assert!(runs(&task, "DEV").is_empty());
        let retry_context = runs(&task, "PLAN")[1].context.clone().unwrap();
        assert!(retry_context.contains("RETRY: PLAN failed"));
        assert!(retry_context.contains("always-red"));
    }

    #[tokio::test]
    async fn test_approval_sent_early_is_applied_at_gate() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, "[templates]\nfeature = [\"PLAN\", \"DEV\"]\n");
        let task = orch
            .create_task("dark mode", TaskType::Feature, "", Vec::new())
            .unwrap();

        let (handle, rx) = orch.control_channel(&task.id);
        assert!(handle.send(ControlSignal::Approve));
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);

        let task = orch.store().load(&task.id).unwrap();
        assert!(task.counter("PLAN").settled);
        assert_eq!(runs(&task, "PLAN").len(), 1);
        assert_eq!(runs(&task, "DEV")[0].status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_detached_gate_reject_then_approve() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, "[templates]\nfeature = [\"PLAN\", \"DEV\"]\n").detach_at_gates();
        let task = orch
            .create_task("dark mode", TaskType::Feature, "", Vec::new())
            .unwrap();

        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(
            orch.run(&task.id, rx).await.unwrap(),
            RunOutcome::AwaitingApproval
        );
        assert_eq!(
            orch.store().load(&task.id).unwrap().status,
            TaskStatus::WaitingApproval
        );

        let delivery = orch
            .deliver(
                &task.id,
                ControlSignal::Reject {
                    feedback: "cover the settings page too".into(),
                },
            )
            .unwrap();
        assert_eq!(delivery, Delivery::Applied);

        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(
            orch.run(&task.id, rx).await.unwrap(),
            RunOutcome::AwaitingApproval
        );
        let reloaded = orch.store().load(&task.id).unwrap();
        let plan = runs(&reloaded, "PLAN");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].status, RunStatus::RolledBackFrom);
        assert_eq!(plan[1].attempt, 2);
        assert!(plan[1].context.as_deref().unwrap().contains("settings page"));

        orch.deliver(&task.id, ControlSignal::Approve).unwrap();
        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);
    }

    #[tokio::test]
    async fn test_interrupt_reruns_current_stage_with_feedback() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            &format!("{}\n[templates]\nbug_fix = [\"PLAN\", \"DEV\"]\n", UNGATED_PLAN),
        );
        let task = orch
            .create_task("fix login", TaskType::BugFix, "", Vec::new())
            .unwrap();
        std::fs::write(dir.path().join(".stagehand/slow-dev"), "").unwrap();

        let (handle, rx) = orch.control_channel(&task.id);
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            handle.send(ControlSignal::Interrupt {
                feedback: Some("use the session store".into()),
            });
            handle
        });

        let outcome = tokio::time::timeout(Duration::from_secs(20), orch.run(&task.id, rx))
            .await
            .unwrap()
            .unwrap();
        drop(sender.await.unwrap());
        assert_eq!(outcome, RunOutcome::Complete);

        let task = orch.store().load(&task.id).unwrap();
        let dev = runs(&task, "DEV");
        assert_eq!(dev.len(), 2);
        assert_eq!(dev[0].status, RunStatus::Interrupted);
        assert_eq!(dev[1].status, RunStatus::Succeeded);
        let context = dev[1].context.as_deref().unwrap();
        assert!(context.contains("OPERATOR INTERRUPT on DEV"));
        assert!(context.contains("use the session store"));
        assert_eq!(task.counter("DEV").failures, 0);
    }

    #[tokio::test]
    async fn test_unchanged_migrations_are_skipped_with_artifact() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            &format!("{}\n[templates]\nfeature = [\"PLAN\", \"DEV\", \"MIGRATION\"]\n", UNGATED_PLAN),
        )
        .with_change_source(Arc::new(StaticChanges(vec!["src/auth.rs".into()])));
        let task = orch
            .create_task("dark mode", TaskType::Feature, "", Vec::new())
            .unwrap();
        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);

        let task = orch.store().load(&task.id).unwrap();
        let migration = runs(&task, "MIGRATION");
        assert_eq!(migration.len(), 1);
        assert_eq!(migration[0].status, RunStatus::Skipped);
        assert!(task.artifact_dir.join("MIGRATION_SKIP.md").exists());
    }

    #[tokio::test]
    async fn test_operator_unskip_runs_stage_the_plan_skipped() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            &format!("{}\n[templates]\nfeature = [\"PLAN\", \"DEV\", \"QA\"]\n", UNGATED_PLAN),
        );
        let plan = || {
            vec![PlanEntry {
                stage: "QA".into(),
                action: crate::resolver::PlanAction::Skip,
                reason: "copy change only".into(),
            }]
        };

        let skipped = orch
            .create_task("copy tweak", TaskType::Feature, "", plan())
            .unwrap();
        let (_handle, rx) = orch.control_channel(&skipped.id);
        assert_eq!(orch.run(&skipped.id, rx).await.unwrap(), RunOutcome::Complete);
        let skipped = orch.store().load(&skipped.id).unwrap();
        assert_eq!(runs(&skipped, "QA")[0].status, RunStatus::Skipped);

        let task = orch
            .create_task("copy tweak again", TaskType::Feature, "", plan())
            .unwrap();
        assert_eq!(
            orch.deliver(&task.id, ControlSignal::Unskip { stage: "QA".into() })
                .unwrap(),
            Delivery::Applied
        );
        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);

        let task = orch.store().load(&task.id).unwrap();
        let qa = runs(&task, "QA");
        assert_eq!(qa.len(), 1);
        assert_eq!(qa[0].status, RunStatus::Succeeded);
        let note = qa[0].note.as_deref().unwrap();
        assert!(note.contains("operator lifted stage plan skip"));
        assert!(note.contains("copy change only"));
        assert!(!task.artifact_dir.join("QA_SKIP.md").exists());
    }

    #[tokio::test]
    async fn test_signal_to_idle_task_is_applied_directly() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, "");
        let task = orch
            .create_task("dark mode", TaskType::Feature, "", Vec::new())
            .unwrap();

        assert_eq!(
            orch.deliver(&task.id, ControlSignal::Pause).unwrap(),
            Delivery::Applied
        );
        assert_eq!(
            orch.store().load(&task.id).unwrap().status,
            TaskStatus::Paused
        );

        let _lock = orch.store().lock(&task.id).unwrap();
        assert_eq!(
            orch.deliver(&task.id, ControlSignal::Skip).unwrap(),
            Delivery::Queued
        );
        assert!(orch.store().task_dir(&task.id).join(control::CONTROL_FILE).exists());
    }

    #[tokio::test]
    async fn test_finished_task_is_not_rerun() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            &format!("{}\n[templates]\nchore = [\"PLAN\"]\n", UNGATED_PLAN),
        );
        let task = orch.create_task("tidy", TaskType::Chore, "", Vec::new()).unwrap();
        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);

        let (_handle, rx) = orch.control_channel(&task.id);
        assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);
        assert_eq!(orch.store().load(&task.id).unwrap().history.len(), 1);
    }
}
