//! Validation command execution.
//!
//! Commands run through `sh -c` in the project directory, in declared order, each in its
//! own supervised process group. The environment carries:
//! - `STAGEHAND_TASK`: task name
//! - `STAGEHAND_STAGE`: stage being validated
//! - `STAGEHAND_ARTIFACT_DIR`: the task's artifact directory

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CommandResult, FailureMode, MAX_OUTPUT_CHARS, MarkerVerdict, ValidationReport, scan_markers,
    truncate_output,
};
use crate::errors::StageError;
use crate::process::{ExitKind, ProcessHandle, ProcessSpec};
use crate::workflow_config::{Check, StageValidation, ValidationCommand};

/// Timeout for commands that do not set their own.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ValidationRunner {
    project_dir: PathBuf,
    artifact_dir: PathBuf,
    task_name: String,
    stage: String,
}

impl ValidationRunner {
    pub fn new(
        project_dir: impl AsRef<Path>,
        artifact_dir: impl AsRef<Path>,
        task_name: &str,
        stage: &str,
    ) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            artifact_dir: artifact_dir.as_ref().to_path_buf(),
            task_name: task_name.to_string(),
            stage: stage.to_string(),
        }
    }

    /// Run every configured command. `fail_fast` stops at the first blocking failure.
    pub async fn run(
        &self,
        validation: &StageValidation,
        cancel: &CancellationToken,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let total = validation.commands.len();

        for (idx, cmd) in validation.commands.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let result = self.run_command(cmd, cancel).await;
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.results.push(result);
                break;
            }

            if result.passed {
                debug!(stage = %self.stage, command = %result.name, "Validation command passed");
            } else {
                match result.mode {
                    FailureMode::Blocking => {
                        warn!(stage = %self.stage, command = %result.name, "Validation command failed")
                    }
                    mode => {
                        info!(stage = %self.stage, command = %result.name, ?mode, "Non-blocking validation failure")
                    }
                }
            }

            let stop = result.is_blocking_failure() && validation.fail_fast;
            report.results.push(result);
            if stop {
                report.stopped_early = idx + 1 < total;
                break;
            }
        }

        report
    }

    async fn run_command(&self, cmd: &ValidationCommand, cancel: &CancellationToken) -> CommandResult {
        let mode = FailureMode::of(cmd);
        let started = Instant::now();

        match cmd.check {
            Check::PathExists { ref path } => {
                let passed = self.resolve_path(path).is_some();
                CommandResult {
                    name: cmd.name.clone(),
                    passed,
                    mode,
                    exit_code: None,
                    timed_out: false,
                    output: if passed {
                        String::new()
                    } else {
                        format!("{} does not exist", path)
                    },
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Check::Shell {
                ref command,
                timeout,
            } => {
                let spec = ProcessSpec::shell(
                    command,
                    self.project_dir.clone(),
                    timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
                )
                .env("STAGEHAND_TASK", &self.task_name)
                .env("STAGEHAND_STAGE", &self.stage)
                .env(
                    "STAGEHAND_ARTIFACT_DIR",
                    self.artifact_dir.to_string_lossy().to_string(),
                );

                let output = match ProcessHandle::spawn(spec, cancel.child_token()) {
                    Ok(handle) => handle.wait().await,
                    Err(e) => Err(anyhow::Error::new(e)),
                };

                let (passed, exit_code, timed_out, text) = match output {
                    Ok(out) => {
                        let exit_code = match out.exit {
                            ExitKind::Exited(code) => Some(code),
                            _ => None,
                        };
                        let passed = out.success()
                            && (!cmd.expect_empty || out.stdout.trim().is_empty());
                        let mut text = out.combined();
                        if out.success() && !passed {
                            text = format!("expected no output, got:\n{}", text);
                        }
                        (passed, exit_code, out.exit == ExitKind::TimedOut, text)
                    }
                    Err(e) => (false, None, false, format!("failed to run: {:#}", e)),
                };

                CommandResult {
                    name: cmd.name.clone(),
                    passed,
                    mode,
                    exit_code,
                    timed_out,
                    output: truncate_output(&text, MAX_OUTPUT_CHARS),
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    /// Artifact directory first, then the project directory.
    fn resolve_path(&self, path: &str) -> Option<PathBuf> {
        let p = Path::new(path);
        if p.is_absolute() {
            return p.exists().then(|| p.to_path_buf());
        }
        [self.artifact_dir.join(p), self.project_dir.join(p)]
            .into_iter()
            .find(|candidate| candidate.exists())
    }

    /// Every `required_artifacts` entry must exist.
    pub fn check_required_artifacts(&self, validation: &StageValidation) -> Result<(), StageError> {
        for name in &validation.required_artifacts {
            if !self.artifact_dir.join(name).exists() {
                return Err(StageError::ArtifactMissing {
                    artifact: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Scan the declared artifact for markers. `None` when the stage declares none.
    pub fn check_markers(
        &self,
        validation: &StageValidation,
    ) -> Result<Option<MarkerVerdict>, StageError> {
        if !validation.has_markers() {
            return Ok(None);
        }
        let Some(ref artifact) = validation.artifact else {
            return Ok(Some(MarkerVerdict::Ambiguous));
        };
        let path = self.artifact_dir.join(artifact);
        let text = std::fs::read_to_string(&path).map_err(|_| StageError::ArtifactMissing {
            artifact: artifact.clone(),
        })?;
        Ok(Some(scan_markers(&text, validation)))
    }
}
