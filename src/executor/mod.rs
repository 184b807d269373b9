//! Stage executor.
//!
//! Runs one stage to completion. Backend stages spawn the configured command with the
//! compiled payload on stdin; mechanical stages go straight to validation. Both end
//! with the same checks: required artifacts, validation commands, marker verdict.
//!
//! The executor never touches the task record. It reports a [`StageResult`] and the
//! orchestrator decides what the outcome means.

pub mod backend;
pub mod payload;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{produced_since, snapshot};
use crate::errors::StageError;
use crate::stage::{StageSpec, TaskType};
use crate::validation::{MarkerVerdict, ValidationReport, ValidationRunner};
use crate::workflow_config::{BackendConfig, StageValidation};
use backend::BackendRun;

/// Everything needed to run one stage, owned so it can move into a spawned task.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub task_id: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub task_description: String,
    pub stage: StageSpec,
    pub attempt: u32,
    /// Feedback attached to this run
    pub context: Option<String>,
    /// `None` for mechanical stages
    pub backend: Option<(String, BackendConfig)>,
    pub validation: StageValidation,
    pub project_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub timeout: Duration,
    /// Artifacts already present from earlier stages
    pub available_artifacts: Vec<String>,
}

impl StageJob {
    /// `<artifact_dir>/logs/<STAGE>_<attempt>.log`
    pub fn log_file(&self) -> PathBuf {
        self.artifact_dir
            .join("logs")
            .join(format!("{}_{}.log", self.stage.name, self.attempt))
    }
}

#[derive(Debug)]
pub enum StageOutcome {
    /// Warnings come from `warn_only` commands and go to the next stage
    Passed { warnings: Vec<String> },
    /// The artifact carries the minor-changes marker
    Minor { warnings: Vec<String> },
    Failed {
        error: StageError,
        /// Skip in-place retries and roll back immediately
        direct_rollback: bool,
    },
    /// An operator signal cancelled the run; carries whatever output was produced
    Cancelled { partial_output: String },
}

impl StageOutcome {
    fn failed(error: StageError) -> Self {
        StageOutcome::Failed {
            error,
            direct_rollback: false,
        }
    }
}

#[derive(Debug)]
pub struct StageResult {
    pub outcome: StageOutcome,
    /// Artifacts created or modified by this run
    pub artifacts: BTreeMap<String, PathBuf>,
    pub validation: Option<ValidationReport>,
    /// Captured backend output
    pub output: String,
}

/// Run `job` until it finishes or `cancel` fires.
pub async fn execute(job: StageJob, cancel: CancellationToken) -> StageResult {
    let before = match snapshot(&job.artifact_dir) {
        Ok(before) => before,
        Err(e) => {
            warn!(stage = %job.stage.name, error = %e, "Failed to snapshot artifacts");
            BTreeMap::new()
        }
    };

    let mut output = String::new();
    if !job.stage.is_mechanical() {
        let Some((ref name, ref config)) = job.backend else {
            return StageResult {
                outcome: StageOutcome::failed(StageError::Other(anyhow::anyhow!(
                    "No backend configured for stage {}",
                    job.stage.name
                ))),
                artifacts: BTreeMap::new(),
                validation: None,
                output,
            };
        };

        match backend::invoke(&job, name, config, &cancel).await {
            BackendRun::Completed(out) => output = out.combined(),
            BackendRun::Cancelled(out) => {
                return StageResult {
                    outcome: StageOutcome::Cancelled {
                        partial_output: out.combined(),
                    },
                    artifacts: collect(&job, &before),
                    validation: None,
                    output: out.combined(),
                };
            }
            BackendRun::Failed { error, output } => {
                warn!(stage = %job.stage.name, attempt = job.attempt, error = %error, "Backend failed");
                return StageResult {
                    outcome: StageOutcome::failed(error),
                    artifacts: collect(&job, &before),
                    validation: None,
                    output,
                };
            }
        }
    }

    let (outcome, validation) = finish(&job, &cancel).await;
    if let StageOutcome::Passed { .. } | StageOutcome::Minor { .. } = outcome {
        info!(task = %job.task_name, stage = %job.stage.name, attempt = job.attempt, "Stage passed");
    }

    StageResult {
        outcome,
        artifacts: collect(&job, &before),
        validation,
        output,
    }
}

fn collect(
    job: &StageJob,
    before: &BTreeMap<String, std::time::SystemTime>,
) -> BTreeMap<String, PathBuf> {
    produced_since(&job.artifact_dir, before).unwrap_or_else(|e| {
        warn!(stage = %job.stage.name, error = %e, "Failed to collect artifacts");
        BTreeMap::new()
    })
}

/// Post-run checks shared by backend and mechanical stages.
async fn finish(
    job: &StageJob,
    cancel: &CancellationToken,
) -> (StageOutcome, Option<ValidationReport>) {
    let runner = ValidationRunner::new(
        &job.project_dir,
        &job.artifact_dir,
        &job.task_name,
        &job.stage.name,
    );

    if let Err(e) = runner.check_required_artifacts(&job.validation) {
        return (StageOutcome::failed(e), None);
    }

    let mut report = runner.run(&job.validation, cancel).await;
    if report.cancelled {
        return (
            StageOutcome::Cancelled {
                partial_output: report.summary(),
            },
            Some(report),
        );
    }
    if let Some(failed) = report.first_blocking_failure() {
        let error = StageError::ValidationCommandFailure {
            command: failed.name.clone(),
            detail: failed.failure_detail(),
        };
        return (StageOutcome::failed(error), Some(report));
    }

    let verdict = match runner.check_markers(&job.validation) {
        Ok(verdict) => verdict,
        Err(e) => return (StageOutcome::failed(e), Some(report)),
    };
    report.verdict = verdict;
    let warnings = report.warnings();
    let artifact = job.validation.artifact.clone().unwrap_or_default();

    let outcome = match verdict {
        None | Some(MarkerVerdict::Pass) => StageOutcome::Passed { warnings },
        Some(MarkerVerdict::Minor) => StageOutcome::Minor { warnings },
        Some(MarkerVerdict::Fail) => StageOutcome::Failed {
            error: StageError::FailVerdict { artifact },
            direct_rollback: true,
        },
        Some(MarkerVerdict::Ambiguous) => {
            StageOutcome::failed(StageError::AmbiguousVerdict { artifact })
        }
    };
    (outcome, Some(report))
}
