//! Validation runner.
//!
//! Runs a stage's configured check commands with per-command failure semantics and
//! scans the stage's declared artifact for pass/fail markers.

pub mod markers;
pub mod runner;

use serde::{Deserialize, Serialize};

pub use markers::{MarkerVerdict, scan_markers};
pub use runner::ValidationRunner;

/// Longest command output kept in a report.
pub const MAX_OUTPUT_CHARS: usize = 4000;

/// How a command's failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Fails the stage
    Blocking,
    Optional,
    AllowFailure,
    WarnOnly,
}

impl FailureMode {
    pub fn of(cmd: &crate::workflow_config::ValidationCommand) -> Self {
        if cmd.warn_only {
            FailureMode::WarnOnly
        } else if cmd.allow_failure {
            FailureMode::AllowFailure
        } else if cmd.optional {
            FailureMode::Optional
        } else {
            FailureMode::Blocking
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub name: String,
    pub passed: bool,
    pub mode: FailureMode,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    /// Combined output, truncated
    #[serde(default)]
    pub output: String,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn is_blocking_failure(&self) -> bool {
        !self.passed && self.mode == FailureMode::Blocking
    }

    /// One-line description of why the command failed.
    pub fn failure_detail(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "check failed".to_string(),
            }
        };
        if self.output.trim().is_empty() {
            status
        } else {
            format!("{}: {}", status, self.output.trim())
        }
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<CommandResult>,
    /// `fail_fast` stopped the pass before every command ran
    #[serde(default)]
    pub stopped_early: bool,
    /// The pass was cancelled by an operator signal
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub verdict: Option<MarkerVerdict>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        !self.cancelled && self.first_blocking_failure().is_none()
    }

    pub fn first_blocking_failure(&self) -> Option<&CommandResult> {
        self.results.iter().find(|r| r.is_blocking_failure())
    }

    /// Failures of `warn_only` commands, to forward to the next stage.
    pub fn warnings(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed && r.mode == FailureMode::WarnOnly)
            .map(|r| format!("{}: {}", r.name, r.failure_detail()))
            .collect()
    }

    /// Human-readable summary for rollback context and retry payloads.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for r in &self.results {
            let mark = if r.passed {
                "PASS"
            } else {
                match r.mode {
                    FailureMode::Blocking => "FAIL",
                    FailureMode::Optional => "FAIL (optional)",
                    FailureMode::AllowFailure => "FAIL (allowed)",
                    FailureMode::WarnOnly => "WARN",
                }
            };
            out.push_str(&format!("- [{}] {}", mark, r.name));
            if !r.passed {
                out.push_str(&format!(": {}", r.failure_detail()));
            }
            out.push('\n');
        }
        if self.stopped_early {
            out.push_str("- remaining commands skipped (fail_fast)\n");
        }
        if let Some(verdict) = self.verdict {
            out.push_str(&format!("- marker verdict: {}\n", verdict));
        }
        out
    }
}

/// Keep the tail of long output, where failures usually are.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let count = output.chars().count();
    if count <= max_chars {
        return output.to_string();
    }
    let tail: String = output.chars().skip(count - max_chars).collect();
    format!("...(truncated)\n{}", tail)
}
