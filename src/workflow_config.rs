//! Workflow configuration read from `.stagehand/stagehand.toml`.
//!
//! Every section is optional and falls back to defaults, so an empty file (or no file)
//! yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-service"
//!
//! [stages]
//! skip = ["DOCS"]
//! timeout = 14400
//! max_retries = 5
//!
//! [stages.overrides.QA]
//! rollback_target = "DEV"
//! max_retries = 2
//!
//! [templates]
//! bug_fix = ["PLAN", "DEV", "TEST", "QA"]
//!
//! [validation.TEST]
//! fail_fast = true
//! commands = [
//!     { name = "unit", command = "cargo test", timeout = 600 },
//!     { name = "lint", command = "cargo clippy", warn_only = true },
//!     { name = "report", path_exists = "TEST_REPORT.md" },
//! ]
//!
//! [validation.MIGRATION.skip_if]
//! no_files_match = ["migrations/**"]
//!
//! [validation.QA]
//! artifact = "QA_REPORT.md"
//! pass_marker = "VERDICT: PASS"
//! fail_marker = "VERDICT: FAIL"
//!
//! [ai]
//! default_backend = "claude"
//!
//! [ai.backends.claude]
//! command = "claude"
//! args = ["--print", "--max-turns", "{max_turns}"]
//! max_turns = 200
//!
//! [ai.stage_backends]
//! REVIEW = "codex"
//!
//! [hub]
//! url = "http://localhost:8080"
//! agent_id = "laptop-1"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Per-stage overrides of the built-in stage catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub rollback_target: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub requires_approval: Option<bool>,
    #[serde(default)]
    pub required: Option<bool>,
    /// Run the stage as a pure validation pass without a backend
    #[serde(default)]
    pub mechanical: Option<bool>,
}

/// The `[stages]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Stages removed from every resolved sequence
    #[serde(default)]
    pub skip: Vec<String>,
    /// Wall-clock limit for one backend invocation, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Consecutive failures tolerated before a forced rollback
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Rollbacks to the same target within an hour before escalating
    #[serde(default = "default_max_rollbacks_per_hour")]
    pub max_rollbacks_per_hour: u32,
    #[serde(default)]
    pub overrides: BTreeMap<String, StageOverride>,
}

fn default_timeout() -> u64 {
    14_400
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_rollbacks_per_hour() -> u32 {
    3
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            skip: Vec::new(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            max_rollbacks_per_hour: default_max_rollbacks_per_hour(),
            overrides: BTreeMap::new(),
        }
    }
}

impl StagesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Whether `stage` is on the hard skip list (case-insensitive).
    pub fn is_skipped(&self, stage: &str) -> bool {
        self.skip.iter().any(|s| s.eq_ignore_ascii_case(stage))
    }
}

/// What a validation command checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// Run a shell command; `timeout` overrides the runner default.
    Shell {
        command: String,
        timeout: Option<Duration>,
    },
    /// Succeed iff the path exists (relative paths resolve against the artifact dir first,
    /// then the project dir).
    PathExists { path: String },
}

/// One entry of `validation.<STAGE>.commands`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand", into = "RawCommand")]
pub struct ValidationCommand {
    pub name: String,
    pub check: Check,
    /// Failure is recorded but does not fail the stage
    pub optional: bool,
    /// Failure is recorded purely informationally
    pub allow_failure: bool,
    /// Failure becomes a warning forwarded to the next stage
    pub warn_only: bool,
    /// Non-empty output counts as failure
    pub expect_empty: bool,
}

impl ValidationCommand {
    pub fn shell(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            check: Check::Shell {
                command: command.to_string(),
                timeout: None,
            },
            optional: false,
            allow_failure: false,
            warn_only: false,
            expect_empty: false,
        }
    }

    pub fn path_exists(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            check: Check::PathExists {
                path: path.to_string(),
            },
            optional: false,
            allow_failure: false,
            warn_only: false,
            expect_empty: false,
        }
    }
}

/// Flat on-disk shape of a validation command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawCommand {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path_exists: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    optional: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    allow_failure: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    warn_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    expect_empty: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TryFrom<RawCommand> for ValidationCommand {
    type Error = String;

    fn try_from(raw: RawCommand) -> std::result::Result<Self, Self::Error> {
        let check = match (raw.command, raw.path_exists) {
            (Some(command), None) => Check::Shell {
                command,
                timeout: raw.timeout.map(Duration::from_secs),
            },
            (None, Some(path)) => Check::PathExists { path },
            (Some(_), Some(_)) => {
                return Err(format!(
                    "validation command '{}' sets both 'command' and 'path_exists'",
                    raw.name
                ));
            }
            (None, None) => {
                return Err(format!(
                    "validation command '{}' needs 'command' or 'path_exists'",
                    raw.name
                ));
            }
        };
        Ok(Self {
            name: raw.name,
            check,
            optional: raw.optional,
            allow_failure: raw.allow_failure,
            warn_only: raw.warn_only,
            expect_empty: raw.expect_empty,
        })
    }
}

impl From<ValidationCommand> for RawCommand {
    fn from(cmd: ValidationCommand) -> Self {
        let mut raw = RawCommand {
            name: cmd.name,
            optional: cmd.optional,
            allow_failure: cmd.allow_failure,
            warn_only: cmd.warn_only,
            expect_empty: cmd.expect_empty,
            ..Default::default()
        };
        match cmd.check {
            Check::Shell { command, timeout } => {
                raw.command = Some(command);
                raw.timeout = timeout.map(|t| t.as_secs());
            }
            Check::PathExists { path } => raw.path_exists = Some(path),
        }
        raw
    }
}

/// `validation.<STAGE>.skip_if`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkipIf {
    /// Skip the stage when no changed file matches any of these globs
    #[serde(default)]
    pub no_files_match: Vec<String>,
}

/// `validation.<STAGE>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageValidation {
    #[serde(default)]
    pub commands: Vec<ValidationCommand>,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<SkipIf>,
    /// Artifact scanned for markers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_marker: Option<String>,
    /// Marker for a minor-change verdict; triggers the fast-track rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_marker: Option<String>,
    /// Artifacts that must exist once the stage reports completion
    #[serde(default)]
    pub required_artifacts: Vec<String>,
    /// Gate the stage on an operator approve/reject decision
    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_approval: bool,
}

fn default_fail_fast() -> bool {
    true
}

impl Default for StageValidation {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            fail_fast: default_fail_fast(),
            skip_if: None,
            artifact: None,
            pass_marker: None,
            fail_marker: None,
            minor_marker: None,
            required_artifacts: Vec::new(),
            requires_approval: false,
        }
    }
}

impl StageValidation {
    pub fn has_markers(&self) -> bool {
        self.pass_marker.is_some() || self.fail_marker.is_some()
    }
}

/// `ai.backends.<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// The backend cannot write files; artifacts arrive as JSON on stdout
    #[serde(default)]
    pub read_only: bool,
}

fn default_max_turns() -> u32 {
    200
}

impl BackendConfig {
    /// The built-in `claude` backend used when nothing is configured.
    pub fn claude_default() -> Self {
        Self {
            command: std::env::var("STAGEHAND_BACKEND_CMD").unwrap_or_else(|_| "claude".to_string()),
            args: vec![
                "--print".to_string(),
                "--max-turns".to_string(),
                "{max_turns}".to_string(),
                "--permission-mode".to_string(),
                "acceptEdits".to_string(),
            ],
            max_turns: default_max_turns(),
            read_only: false,
        }
    }
}

/// The `[ai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_backend_name")]
    pub default_backend: String,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    /// Stage name -> backend name
    #[serde(default)]
    pub stage_backends: BTreeMap<String, String>,
}

fn default_backend_name() -> String {
    "claude".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend_name(),
            backends: BTreeMap::new(),
            stage_backends: BTreeMap::new(),
        }
    }
}

/// The `[hub]` section: where lifecycle events are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Delivery attempts per event before it is dropped
    #[serde(default = "default_hub_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_hub_timeout")]
    pub timeout_secs: u64,
}

fn default_hub_attempts() -> u32 {
    3
}

fn default_hub_timeout() -> u64 {
    5
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: None,
            agent_id: None,
            max_attempts: default_hub_attempts(),
            timeout_secs: default_hub_timeout(),
        }
    }
}

impl HubConfig {
    /// Hub URL with environment override.
    pub fn url(&self) -> Option<String> {
        std::env::var("STAGEHAND_HUB_URL").ok().or_else(|| self.url.clone())
    }
}

/// The complete stagehand.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    /// Task type -> ordered stage names, replacing the built-in template
    #[serde(default)]
    pub templates: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub validation: BTreeMap<String, StageValidation>,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

impl WorkflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagehand.toml")
    }

    /// Load `stagehand.toml` from the given directory, or defaults if absent.
    pub fn load_or_default(stagehand_dir: &Path) -> Result<Self> {
        let config_path = stagehand_dir.join(crate::config::CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize stagehand.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validation settings for a stage (defaults when unconfigured).
    pub fn stage_validation(&self, stage: &str) -> StageValidation {
        self.validation
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(stage))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    pub fn stage_override(&self, stage: &str) -> Option<&StageOverride> {
        self.stages
            .overrides
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(stage))
            .map(|(_, o)| o)
    }

    /// Resolve the backend for a stage: `ai.stage_backends`, then `ai.default_backend`.
    ///
    /// The name `claude` resolves to the built-in default when not configured.
    pub fn backend_for_stage(&self, stage: &str) -> Option<(String, BackendConfig)> {
        let name = self
            .ai
            .stage_backends
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(stage))
            .map(|(_, b)| b.clone())
            .unwrap_or_else(|| self.ai.default_backend.clone());

        match self.ai.backends.get(&name) {
            Some(cfg) => Some((name, cfg.clone())),
            None if name == "claude" => Some((name, BackendConfig::claude_default())),
            None => None,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let known = crate::stage::known_stage_names();
        let is_known = |s: &str| {
            known.iter().any(|k| k.eq_ignore_ascii_case(s))
                || self
                    .templates
                    .values()
                    .any(|stages| stages.iter().any(|t| t.eq_ignore_ascii_case(s)))
        };

        for stage in &self.stages.skip {
            if !is_known(stage) {
                warnings.push(format!("stages.skip names unknown stage '{}'", stage));
            }
        }

        for (stage, backend) in &self.ai.stage_backends {
            if !self.ai.backends.contains_key(backend) && backend != "claude" {
                warnings.push(format!(
                    "ai.stage_backends.{} uses undefined backend '{}'",
                    stage, backend
                ));
            }
        }

        for (stage, validation) in &self.validation {
            if let Some(ref skip_if) = validation.skip_if {
                for pattern in &skip_if.no_files_match {
                    if let Err(e) = glob::Pattern::new(pattern) {
                        warnings.push(format!(
                            "validation.{}.skip_if has invalid glob '{}': {}",
                            stage, pattern, e
                        ));
                    }
                }
            }
            if validation.has_markers() && validation.artifact.is_none() {
                warnings.push(format!(
                    "validation.{} declares markers but no artifact to scan",
                    stage
                ));
            }
        }

        if self.stages.timeout == 0 {
            warnings.push("stages.timeout is 0; every backend invocation will time out".into());
        }

        warnings
    }
}
