//! Task and StageRun model.
//!
//! A `Task` is the persisted record of one development task moving through its stages.
//! `history` is append-only; closed `StageRun`s are never rewritten except for the
//! `RolledBackFrom` invalidation a rollback applies.

pub mod store;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::resolver::PlanEntry;
use crate::stage::TaskType;
use crate::validation::ValidationReport;
use crate::workflow_config::WorkflowToml;

pub use store::TaskStore;

/// Current persisted schema version.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    WaitingApproval,
    Paused,
    RolledBack,
    Complete,
    Failed,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Abandoned
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Paused => "paused",
            TaskStatus::RolledBack => "rolled_back",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    /// Closed by an operator signal or by crash recovery
    Interrupted,
    /// Invalidated by a rollback that re-entered an earlier stage
    RolledBackFrom,
}

impl RunStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::Interrupted => "interrupted",
            RunStatus::RolledBackFrom => "rolled_back_from",
        };
        write!(f, "{}", s)
    }
}

/// Why a run failed, in a form that survives serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: String,
    pub message: String,
}

impl From<&crate::errors::StageError> for FailureRecord {
    fn from(err: &crate::errors::StageError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One execution of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    pub stage: String,
    pub attempt: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
    /// Feedback this run was started with (retry failure, rejection, interrupt output)
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    /// Skip reasons, conflict notes and operator notes
    #[serde(default)]
    pub note: Option<String>,
}

impl StageRun {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Attempt bookkeeping for one stage's current episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounter {
    /// Runs started in this episode
    pub runs: u32,
    /// Consecutive failures in this episode
    pub failures: u32,
    /// The stage succeeded and advanced; the next run opens a new episode
    pub settled: bool,
}

impl AttemptCounter {
    /// Start a run and return its attempt number.
    pub fn start_run(&mut self) -> u32 {
        if self.settled {
            *self = AttemptCounter::default();
        }
        self.runs += 1;
        self.runs
    }

    /// Record a failure and return the consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    pub fn settle(&mut self) {
        self.settled = true;
        self.failures = 0;
    }

    /// Re-enter this stage as a rollback target: the episode continues with a fresh
    /// retry budget.
    pub fn reopen(&mut self) {
        self.settled = false;
        self.failures = 0;
    }
}

/// A rollback that happened, kept for loop detection and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub from: String,
    pub target: String,
    pub at: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub fast_track: bool,
}

/// An active fast-track window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastTrack {
    pub target: String,
    pub failing_stage: String,
    /// Stages strictly between target and failing stage that succeeded in this pass
    pub skippable: Vec<String>,
}

/// Persisted record of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub description: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Why the task is paused or failed
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Active or next-pending stage; `None` once the sequence is exhausted
    pub current_stage: Option<String>,
    #[serde(default)]
    pub history: Vec<StageRun>,
    /// Configuration snapshot taken at creation
    pub config: WorkflowToml,
    pub artifact_dir: PathBuf,
    #[serde(default)]
    pub attempts: BTreeMap<String, AttemptCounter>,
    #[serde(default)]
    pub pending_context: Option<String>,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub fast_track: Option<FastTrack>,
    #[serde(default)]
    pub rollback_log: Vec<RollbackRecord>,
    /// Caller-supplied stage recommendations
    #[serde(default)]
    pub stage_plan: Vec<PlanEntry>,
    /// Stage the operator moved onto explicitly; it runs regardless of soft skips
    #[serde(default)]
    pub operator_override: Option<String>,
    /// Stages whose stage-plan skip the operator lifted
    #[serde(default)]
    pub lifted_skips: BTreeSet<String>,
}

/// Make a filesystem-safe slug from a task name.
pub fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.chars().take(40).collect()
    }
}

impl Task {
    /// Build a new pending task. `artifact_dir` is filled in by the store.
    pub fn new(
        name: &str,
        task_type: TaskType,
        description: &str,
        config: WorkflowToml,
        first_stage: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let slug = slugify(name);
        Self {
            schema_version: SCHEMA_VERSION,
            id: format!("{}-{}", slug, &uuid[..8]),
            name: name.to_string(),
            task_type,
            description: description.to_string(),
            branch: format!("{}/{}", task_type, slug),
            created_at: now,
            updated_at: now,
            status: TaskStatus::Pending,
            status_reason: None,
            current_stage: first_stage,
            history: Vec::new(),
            config,
            artifact_dir: PathBuf::new(),
            attempts: BTreeMap::new(),
            pending_context: None,
            base_commit: None,
            fast_track: None,
            rollback_log: Vec::new(),
            stage_plan: Vec::new(),
            operator_override: None,
            lifted_skips: BTreeSet::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: TaskStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.touch();
    }

    pub fn counter(&self, stage: &str) -> AttemptCounter {
        self.attempts.get(stage).copied().unwrap_or_default()
    }

    pub fn counter_mut(&mut self, stage: &str) -> &mut AttemptCounter {
        self.attempts.entry(stage.to_string()).or_default()
    }

    pub fn active_run(&self) -> Option<&StageRun> {
        self.history.iter().rev().find(|r| r.status.is_open())
    }

    pub fn active_run_mut(&mut self) -> Option<&mut StageRun> {
        self.history.iter_mut().rev().find(|r| r.status.is_open())
    }

    pub fn last_run_of(&self, stage: &str) -> Option<&StageRun> {
        self.history.iter().rev().find(|r| r.stage == stage)
    }

    /// Open a new running StageRun for `stage`, consuming any pending context.
    ///
    /// Fails if another run is still open.
    pub fn begin_run(&mut self, stage: &str, backend: Option<String>) -> Result<u32> {
        if let Some(open) = self.active_run() {
            bail!(
                "Cannot start {}: run {} attempt {} is still {}",
                stage,
                open.stage,
                open.attempt,
                open.status
            );
        }
        let attempt = self.counter_mut(stage).start_run();
        let context = self.pending_context.take();
        self.history.push(StageRun {
            stage: stage.to_string(),
            attempt,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            backend,
            artifacts: BTreeMap::new(),
            validation: None,
            context,
            failure: None,
            note: None,
        });
        self.current_stage = Some(stage.to_string());
        self.set_status(TaskStatus::Running, None);
        Ok(attempt)
    }

    /// Close the open run with a terminal status.
    pub fn close_active(
        &mut self,
        status: RunStatus,
        failure: Option<FailureRecord>,
        note: Option<String>,
    ) -> Result<&StageRun> {
        if status.is_open() {
            bail!("Cannot close a run as {}", status);
        }
        let Some(run) = self.active_run_mut() else {
            bail!("No open run to close");
        };
        run.status = status;
        run.ended_at = Some(Utc::now());
        if failure.is_some() {
            run.failure = failure;
        }
        if note.is_some() {
            run.note = note;
        }
        self.touch();
        self.active_or_last()
    }

    fn active_or_last(&self) -> Result<&StageRun> {
        self.history
            .last()
            .ok_or_else(|| anyhow::anyhow!("Task {} has no stage history", self.id))
    }

    /// Record a stage that was skipped without running.
    pub fn record_skip(&mut self, stage: &str, note: String) {
        let now = Utc::now();
        let attempt = self.counter(stage).runs;
        self.history.push(StageRun {
            stage: stage.to_string(),
            attempt,
            status: RunStatus::Skipped,
            started_at: now,
            ended_at: Some(now),
            backend: None,
            artifacts: BTreeMap::new(),
            validation: None,
            context: None,
            failure: None,
            note: Some(note),
        });
        self.touch();
    }

    /// Append feedback to the context handed to the next run.
    pub fn push_context(&mut self, text: &str) {
        match self.pending_context {
            Some(ref mut existing) => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
            None => self.pending_context = Some(text.to_string()),
        }
    }

    /// Reclassify runs left open by a dead process as interrupted.
    ///
    /// Returns the stages that were reclassified.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        for run in self.history.iter_mut().filter(|r| r.status.is_open()) {
            run.status = RunStatus::Interrupted;
            run.ended_at = Some(now);
            run.note = Some("process exited while the stage was running".to_string());
            recovered.push(run.stage.clone());
        }
        if let Some(stage) = recovered.last() {
            self.current_stage = Some(stage.clone());
            self.push_context(&format!(
                "The previous {} run was interrupted before it finished. Re-check any partial \
                 changes before continuing.",
                stage
            ));
            if self.status == TaskStatus::Running {
                self.status = TaskStatus::Paused;
                self.status_reason = Some("recovered after crash".to_string());
            }
        }
        recovered
    }

    /// Latest run for each stage, in first-seen order.
    pub fn latest_runs(&self) -> Vec<&StageRun> {
        let mut order: Vec<&str> = Vec::new();
        for run in &self.history {
            if !order.contains(&run.stage.as_str()) {
                order.push(&run.stage);
            }
        }
        order
            .into_iter()
            .filter_map(|stage| self.last_run_of(stage))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "Fix login bug!",
            TaskType::BugFix,
            "users cannot log in",
            WorkflowToml::default(),
            Some("PLAN".into()),
        )
    }

    #[test]
    fn test_new_task_defaults() {
        let t = task();
        assert!(t.id.starts_with("fix-login-bug-"));
        assert_eq!(t.branch, "bug_fix/fix-login-bug");
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.schema_version, SCHEMA_VERSION);
        assert_eq!(t.current_stage.as_deref(), Some("PLAN"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth  (v2)"), "add-oauth-v2");
        assert_eq!(slugify("!!!"), "task");
    }

    #[test]
    fn test_only_one_open_run() {
        let mut t = task();
        t.begin_run("PLAN", None).unwrap();
        assert!(t.begin_run("DEV", None).is_err());
        t.close_active(RunStatus::Succeeded, None, None).unwrap();
        assert!(t.begin_run("DEV", None).is_ok());
        assert_eq!(t.history.iter().filter(|r| r.status.is_open()).count(), 1);
    }

    #[test]
    fn test_begin_run_consumes_pending_context() {
        let mut t = task();
        t.push_context("first");
        t.push_context("second");
        t.begin_run("PLAN", Some("claude".into())).unwrap();
        let run = t.active_run().unwrap();
        assert_eq!(run.context.as_deref(), Some("first\n\nsecond"));
        assert!(t.pending_context.is_none());
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn test_attempt_counter_episodes() {
        let mut c = AttemptCounter::default();
        assert_eq!(c.start_run(), 1);
        assert_eq!(c.record_failure(), 1);
        assert_eq!(c.start_run(), 2);
        c.settle();
        // A settled stage starts a fresh episode.
        assert_eq!(c.start_run(), 1);
        c.settle();
        // Re-entered as a rollback target: the episode continues.
        c.reopen();
        assert_eq!(c.start_run(), 2);
        assert_eq!(c.failures, 0);
    }

    #[test]
    fn test_close_requires_terminal_status() {
        let mut t = task();
        t.begin_run("PLAN", None).unwrap();
        assert!(t.close_active(RunStatus::Running, None, None).is_err());
        let run = t
            .close_active(
                RunStatus::Failed,
                Some(FailureRecord {
                    kind: "backend_timeout".into(),
                    message: "timed out".into(),
                }),
                None,
            )
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.ended_at.is_some());
        assert!(t.close_active(RunStatus::Failed, None, None).is_err());
    }

    #[test]
    fn test_recover_interrupted_never_marks_success() {
        let mut t = task();
        t.begin_run("PLAN", None).unwrap();
        t.close_active(RunStatus::Succeeded, None, None).unwrap();
        t.begin_run("DEV", None).unwrap();

        let recovered = t.recover_interrupted();
        assert_eq!(recovered, vec!["DEV".to_string()]);
        let dev = t.last_run_of("DEV").unwrap();
        assert_eq!(dev.status, RunStatus::Interrupted);
        assert_eq!(t.current_stage.as_deref(), Some("DEV"));
        assert_eq!(t.status, TaskStatus::Paused);
        assert!(t.pending_context.as_deref().unwrap().contains("interrupted"));
        assert!(t.active_run().is_none());
    }

    #[test]
    fn test_latest_runs() {
        let mut t = task();
        t.begin_run("PLAN", None).unwrap();
        t.close_active(RunStatus::Failed, None, None).unwrap();
        t.begin_run("PLAN", None).unwrap();
        t.close_active(RunStatus::Succeeded, None, None).unwrap();
        t.record_skip("DESIGN", "not needed".into());
        let latest = t.latest_runs();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].attempt, 2);
        assert_eq!(latest[1].status, RunStatus::Skipped);
    }
}
