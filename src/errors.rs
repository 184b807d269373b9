//! Typed error hierarchy for the stagehand orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StageError`: stage-level failures handed to the retry/rollback policy
//! - `StoreError`: task record persistence failures
//! - `ConfigError`: invalid workflow configuration

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Stage-level failures. Every variant reaches the retry/rollback controller.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to start backend '{backend}': {source}")]
    BackendInvocation {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend '{backend}' timed out after {}s", .timeout.as_secs())]
    BackendTimeout { backend: String, timeout: Duration },

    #[error("Backend '{backend}' exited with non-zero code {exit_code}")]
    BackendNonZeroExit { backend: String, exit_code: i32 },

    #[error("Validation command '{command}' failed: {detail}")]
    ValidationCommandFailure { command: String, detail: String },

    #[error("Required artifact '{artifact}' missing after stage completed")]
    ArtifactMissing { artifact: String },

    #[error("No pass or fail marker found in artifact '{artifact}'")]
    AmbiguousVerdict { artifact: String },

    #[error("Artifact '{artifact}' carries the fail marker")]
    FailVerdict { artifact: String },

    #[error("Approval rejected: {feedback}")]
    ApprovalRejected { feedback: String },

    #[error("Stage {stage} exceeded {max_retries} retries")]
    MaxRetriesExceeded { stage: String, max_retries: u32 },

    #[error("Stage interrupted by operator")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Failures that must be decided by a human instead of retried.
    pub fn requires_manual_decision(&self) -> bool {
        matches!(self, StageError::AmbiguousVerdict { .. })
    }

    /// Short machine-readable kind, used in events and rollback logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::BackendInvocation { .. } => "backend_invocation",
            StageError::BackendTimeout { .. } => "backend_timeout",
            StageError::BackendNonZeroExit { .. } => "backend_non_zero_exit",
            StageError::ValidationCommandFailure { .. } => "validation_command_failure",
            StageError::ArtifactMissing { .. } => "artifact_missing",
            StageError::AmbiguousVerdict { .. } => "ambiguous_verdict",
            StageError::FailVerdict { .. } => "fail_verdict",
            StageError::ApprovalRejected { .. } => "approval_rejected",
            StageError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            StageError::Interrupted => "interrupted",
            StageError::Other(_) => "other",
        }
    }
}

/// Errors from the task state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task record at {path} is corrupt: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Task record at {path} has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Task {id} is already being driven by another process")]
    Locked { id: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from workflow configuration resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("Stage {stage} rolls back to {target}, which does not precede it")]
    ForwardRollback { stage: String, target: String },

    #[error("Stage {stage} uses undefined backend '{backend}'")]
    UnknownBackend { stage: String, backend: String },

    #[error("Invalid glob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
