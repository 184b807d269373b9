//! Backend invocation: spawn the configured command, feed it the payload, classify
//! the exit, and write artifacts on behalf of read-only backends.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::io::Write;
use std::path::{Component, Path};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StageJob;
use super::payload::{compile_payload, substitute_args};
use crate::artifacts::{is_reserved, write_artifact};
use crate::errors::StageError;
use crate::process::{ExitKind, ProcessHandle, ProcessOutput, ProcessSpec};
use crate::workflow_config::BackendConfig;

/// Result of one backend invocation.
pub enum BackendRun {
    Completed(ProcessOutput),
    Cancelled(ProcessOutput),
    Failed {
        error: StageError,
        output: String,
    },
}

#[derive(Debug, Deserialize)]
struct ArtifactBundle {
    artifacts: Vec<ArtifactFile>,
}

#[derive(Debug, Deserialize)]
struct ArtifactFile {
    name: String,
    content: String,
}

/// Run `backend` for `job`, logging payload and output to the run's log file.
pub async fn invoke(
    job: &StageJob,
    name: &str,
    backend: &BackendConfig,
    cancel: &CancellationToken,
) -> BackendRun {
    let payload = compile_payload(job, backend.read_only);
    let args = substitute_args(&backend.args, job, backend.max_turns);

    if let Err(e) = write_log(&job.log_file(), &format!("=== PAYLOAD ===\n{}\n", payload)) {
        warn!(stage = %job.stage.name, error = %e, "Failed to write run log");
    }

    let mut spec = ProcessSpec {
        program: backend.command.clone(),
        args,
        cwd: job.project_dir.clone(),
        env: Vec::new(),
        stdin: Some(payload),
        timeout: job.timeout,
    }
    .env("STAGEHAND_TASK", &job.task_name)
    .env("STAGEHAND_STAGE", &job.stage.name)
    .env("STAGEHAND_ATTEMPT", job.attempt.to_string())
    .env(
        "STAGEHAND_ARTIFACT_DIR",
        job.artifact_dir.to_string_lossy().to_string(),
    );
    if backend.read_only {
        spec = spec.env("STAGEHAND_READ_ONLY", "1");
    }

    info!(
        task = %job.task_name,
        stage = %job.stage.name,
        attempt = job.attempt,
        backend = %name,
        "Invoking backend"
    );

    let handle = match ProcessHandle::spawn(spec, cancel.child_token()) {
        Ok(handle) => handle,
        Err(source) => {
            return BackendRun::Failed {
                error: StageError::BackendInvocation {
                    backend: name.to_string(),
                    source,
                },
                output: String::new(),
            };
        }
    };

    let output = match handle.wait().await {
        Ok(output) => output,
        Err(e) => {
            return BackendRun::Failed {
                error: StageError::Other(e),
                output: String::new(),
            };
        }
    };

    if let Err(e) = write_log(
        &job.log_file(),
        &format!(
            "=== OUTPUT ({:?}, {:.1}s) ===\n{}\n",
            output.exit,
            output.elapsed.as_secs_f64(),
            output.combined()
        ),
    ) {
        warn!(stage = %job.stage.name, error = %e, "Failed to write run log");
    }
    debug!(stage = %job.stage.name, exit = ?output.exit, "Backend finished");

    match output.exit {
        ExitKind::Exited(0) => {}
        ExitKind::Cancelled => return BackendRun::Cancelled(output),
        ExitKind::TimedOut => {
            return BackendRun::Failed {
                error: StageError::BackendTimeout {
                    backend: name.to_string(),
                    timeout: job.timeout,
                },
                output: output.combined(),
            };
        }
        ExitKind::Exited(code) => {
            return BackendRun::Failed {
                error: StageError::BackendNonZeroExit {
                    backend: name.to_string(),
                    exit_code: code,
                },
                output: output.combined(),
            };
        }
        ExitKind::Signalled => {
            return BackendRun::Failed {
                error: StageError::BackendNonZeroExit {
                    backend: name.to_string(),
                    exit_code: -1,
                },
                output: output.combined(),
            };
        }
    }

    if backend.read_only
        && let Err(e) = write_read_only_artifacts(&job.artifact_dir, &output.stdout)
    {
        return BackendRun::Failed {
            error: StageError::Other(e.context(format!(
                "Read-only backend '{}' returned no usable artifacts",
                name
            ))),
            output: output.combined(),
        };
    }

    BackendRun::Completed(output)
}

fn write_log(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

/// Parse `{"artifacts": [...]}` from stdout (whole output, or its last JSON line) and
/// write each artifact.
pub fn write_read_only_artifacts(artifact_dir: &Path, stdout: &str) -> Result<Vec<String>> {
    let bundle: ArtifactBundle = match serde_json::from_str(stdout.trim()) {
        Ok(bundle) => bundle,
        Err(_) => stdout
            .lines()
            .rev()
            .filter(|l| l.trim_start().starts_with('{'))
            .find_map(|l| serde_json::from_str(l.trim()).ok())
            .context("stdout contains no {\"artifacts\": [...]} object")?,
    };

    // Reject the whole bundle before writing any of it.
    for file in &bundle.artifacts {
        if file.name.is_empty()
            || Path::new(&file.name)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("artifact name '{}' is not a plain relative path", file.name);
        }
        if is_reserved(&file.name) {
            bail!("artifact name '{}' is reserved for the orchestrator", file.name);
        }
    }

    let mut written = Vec::new();
    for file in bundle.artifacts {
        write_artifact(artifact_dir, &file.name, &file.content)?;
        written.push(file.name);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_only_bundle_whole_output() {
        let dir = tempdir().unwrap();
        let names = write_read_only_artifacts(
            dir.path(),
            r##"{"artifacts": [{"name": "REVIEW.md", "content": "# Review\nAPPROVED"}]}"##,
        )
        .unwrap();
        assert_eq!(names, vec!["REVIEW.md".to_string()]);
        assert!(
            std::fs::read_to_string(dir.path().join("REVIEW.md"))
                .unwrap()
                .contains("APPROVED")
        );
    }

    #[test]
    fn test_read_only_bundle_last_json_line() {
        let dir = tempdir().unwrap();
        let stdout = "thinking...\n{\"artifacts\": [{\"name\": \"A.md\", \"content\": \"a\"}]}\n";
        let names = write_read_only_artifacts(dir.path(), stdout).unwrap();
        assert_eq!(names, vec!["A.md".to_string()]);
    }

    #[test]
    fn test_read_only_bundle_rejects_escape() {
        let dir = tempdir().unwrap();
        let stdout = r#"{"artifacts": [{"name": "../evil.md", "content": "x"}]}"#;
        assert!(write_read_only_artifacts(dir.path(), stdout).is_err());
        assert!(write_read_only_artifacts(dir.path(), "no json here").is_err());
    }

    #[test]
    fn test_read_only_bundle_rejects_orchestrator_files() {
        let dir = tempdir().unwrap();
        let stdout = r#"{"artifacts": [
            {"name": "PLAN.md", "content": "plan"},
            {"name": "control.json", "content": "{\"signal\":\"skip\"}"}
        ]}"#;
        let err = write_read_only_artifacts(dir.path(), stdout).unwrap_err();
        assert!(err.to_string().contains("reserved"));
        assert!(!dir.path().join("control.json").exists());
        assert!(!dir.path().join("PLAN.md").exists());

        for name in ["task.json", ".lock", "logs/DEV.log", "control.json.taken"] {
            let stdout = format!(r#"{{"artifacts": [{{"name": "{}", "content": "x"}}]}}"#, name);
            assert!(write_read_only_artifacts(dir.path(), &stdout).is_err(), "{}", name);
        }
    }
}
