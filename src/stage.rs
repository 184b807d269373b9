//! Stage definitions and the workflow template registry.
//!
//! This module provides:
//! - `TaskType` and the built-in stage template for each type
//! - `StageSpec` describing one stage's defaults (kind, rollback target, retry limit)
//! - `WorkflowTemplate`, the ordered baseline list for one task type
//! - `template_for`, which merges the built-in catalog with `stagehand.toml`

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::workflow_config::{SkipIf, WorkflowToml};

pub const PLAN: &str = "PLAN";
pub const DESIGN: &str = "DESIGN";
pub const PREFLIGHT: &str = "PREFLIGHT";
pub const DEV: &str = "DEV";
pub const MIGRATION: &str = "MIGRATION";
pub const TEST: &str = "TEST";
pub const QA: &str = "QA";
pub const SECURITY: &str = "SECURITY";
pub const REVIEW: &str = "REVIEW";
pub const DOCS: &str = "DOCS";

/// The stage operators return to after an interrupt; successful runs of it resolve
/// outstanding rollback context.
pub const IMPLEMENTATION_STAGE: &str = DEV;

/// Kind of task being driven; selects the baseline stage template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    BugFix,
    Refactor,
    Chore,
    Docs,
    Hotfix,
}

impl TaskType {
    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::Feature,
            TaskType::BugFix,
            TaskType::Refactor,
            TaskType::Chore,
            TaskType::Docs,
            TaskType::Hotfix,
        ]
    }

    /// Built-in stage order for this task type.
    fn builtin_stages(&self) -> &'static [&'static str] {
        match self {
            TaskType::Feature => &[
                PLAN, DESIGN, PREFLIGHT, DEV, MIGRATION, TEST, QA, SECURITY, REVIEW, DOCS,
            ],
            TaskType::BugFix => &[PLAN, PREFLIGHT, DEV, TEST, QA, REVIEW],
            TaskType::Refactor => &[PLAN, DESIGN, PREFLIGHT, DEV, TEST, QA, REVIEW],
            TaskType::Chore => &[PLAN, PREFLIGHT, DEV, TEST, REVIEW],
            TaskType::Docs => &[PLAN, DOCS],
            TaskType::Hotfix => &[PLAN, DEV, TEST, REVIEW],
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Feature => write!(f, "feature"),
            TaskType::BugFix => write!(f, "bug_fix"),
            TaskType::Refactor => write!(f, "refactor"),
            TaskType::Chore => write!(f, "chore"),
            TaskType::Docs => write!(f, "docs"),
            TaskType::Hotfix => write!(f, "hotfix"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "feature" => Ok(TaskType::Feature),
            "bug_fix" | "bugfix" => Ok(TaskType::BugFix),
            "refactor" => Ok(TaskType::Refactor),
            "chore" => Ok(TaskType::Chore),
            "docs" => Ok(TaskType::Docs),
            "hotfix" => Ok(TaskType::Hotfix),
            _ => Err(ConfigError::UnknownTaskType(s.to_string())),
        }
    }
}

/// How a stage does its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Invokes an external AI backend process
    Backend,
    /// Runs only the stage's validation commands
    Mechanical,
}

/// Defaults for one stage of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    /// Required stages ignore soft skips (dynamic plans and file-diff conditions)
    #[serde(default)]
    pub required: bool,
    /// Default file-diff skip condition
    #[serde(default)]
    pub skip_if: Option<SkipIf>,
    /// Earlier stage re-entered after retry exhaustion; `None` means the preceding stage
    #[serde(default)]
    pub rollback_target: Option<String>,
    /// Retry-limit override for this stage
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl StageSpec {
    pub fn backend(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: StageKind::Backend,
            required: false,
            skip_if: None,
            rollback_target: None,
            max_retries: None,
            requires_approval: false,
        }
    }

    pub fn mechanical(name: &str) -> Self {
        Self {
            kind: StageKind::Mechanical,
            ..Self::backend(name)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn gated(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn rolls_back_to(mut self, target: &str) -> Self {
        self.rollback_target = Some(target.to_string());
        self
    }

    pub fn skip_unless_changed(mut self, globs: &[&str]) -> Self {
        self.skip_if = Some(SkipIf {
            no_files_match: globs.iter().map(|g| g.to_string()).collect(),
        });
        self
    }

    pub fn is_mechanical(&self) -> bool {
        self.kind == StageKind::Mechanical
    }
}

/// The built-in stage catalog.
fn catalog() -> Vec<StageSpec> {
    vec![
        StageSpec::backend(PLAN).required().gated(),
        StageSpec::backend(DESIGN).gated().rolls_back_to(PLAN),
        StageSpec::mechanical(PREFLIGHT),
        StageSpec::backend(DEV).required().rolls_back_to(DESIGN),
        StageSpec::backend(MIGRATION)
            .rolls_back_to(DEV)
            .skip_unless_changed(&["migrations/**", "*.sql"]),
        StageSpec::backend(TEST).rolls_back_to(DEV),
        StageSpec::backend(QA).rolls_back_to(DEV),
        StageSpec::backend(SECURITY).rolls_back_to(DEV),
        StageSpec::backend(REVIEW).rolls_back_to(DEV),
        StageSpec::backend(DOCS).rolls_back_to(DEV),
    ]
}

/// Names of every stage in the built-in catalog, in canonical order.
pub fn known_stage_names() -> Vec<&'static str> {
    vec![
        PLAN, DESIGN, PREFLIGHT, DEV, MIGRATION, TEST, QA, SECURITY, REVIEW, DOCS,
    ]
}

/// Ordered baseline stage list for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub task_type: TaskType,
    pub stages: Vec<StageSpec>,
}

impl WorkflowTemplate {
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }

    pub fn get(&self, stage: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == stage)
    }

    pub fn first(&self) -> Option<&StageSpec> {
        self.stages.first()
    }

    /// Every configured rollback target must be strictly earlier in the template.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (idx, spec) in self.stages.iter().enumerate() {
            if let Some(ref target) = spec.rollback_target
                && let Some(target_idx) = self.position(target)
                && target_idx >= idx
            {
                return Err(ConfigError::ForwardRollback {
                    stage: spec.name.clone(),
                    target: target.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Build the template for `task_type`, applying `[templates]`, `[stages.overrides]`
/// and per-stage validation settings from the configuration.
pub fn template_for(
    task_type: TaskType,
    config: &WorkflowToml,
) -> Result<WorkflowTemplate, ConfigError> {
    let names: Vec<String> = match config.templates.get(&task_type.to_string()) {
        Some(list) => list.iter().map(|s| s.to_uppercase()).collect(),
        None => task_type
            .builtin_stages()
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };

    let catalog = catalog();
    let mut stages = Vec::with_capacity(names.len());
    for name in &names {
        let mut spec = catalog
            .iter()
            .find(|s| &s.name == name)
            .cloned()
            .unwrap_or_else(|| StageSpec::backend(name));

        let validation = config.stage_validation(name);
        if validation.skip_if.is_some() {
            spec.skip_if = validation.skip_if.clone();
        }
        if validation.requires_approval {
            spec.requires_approval = true;
        }

        if let Some(ov) = config.stage_override(name) {
            if let Some(ref target) = ov.rollback_target {
                spec.rollback_target = Some(target.to_uppercase());
            }
            if ov.max_retries.is_some() {
                spec.max_retries = ov.max_retries;
            }
            if let Some(gated) = ov.requires_approval {
                spec.requires_approval = gated;
            }
            if let Some(required) = ov.required {
                spec.required = required;
            }
            if let Some(mechanical) = ov.mechanical {
                spec.kind = if mechanical {
                    StageKind::Mechanical
                } else {
                    StageKind::Backend
                };
            }
        }

        // A target outside this template falls back to the preceding stage.
        if let Some(ref target) = spec.rollback_target
            && !names.contains(target)
        {
            spec.rollback_target = None;
        }

        if spec.kind == StageKind::Backend && config.backend_for_stage(name).is_none() {
            let backend = config
                .ai
                .stage_backends
                .get(name)
                .cloned()
                .unwrap_or_else(|| config.ai.default_backend.clone());
            return Err(ConfigError::UnknownBackend {
                stage: name.clone(),
                backend,
            });
        }

        stages.push(spec);
    }

    let template = WorkflowTemplate { task_type, stages };
    template.validate()?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trips_through_display() {
        for tt in TaskType::all() {
            let parsed: TaskType = tt.to_string().parse().unwrap();
            assert_eq!(&parsed, tt);
        }
        assert_eq!("bugfix".parse::<TaskType>().unwrap(), TaskType::BugFix);
        assert_eq!("Bug-Fix".parse::<TaskType>().unwrap(), TaskType::BugFix);
        assert!(matches!(
            "epic".parse::<TaskType>(),
            Err(ConfigError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_builtin_bug_fix_template() {
        let template = template_for(TaskType::BugFix, &WorkflowToml::default()).unwrap();
        let names: Vec<_> = template.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![PLAN, PREFLIGHT, DEV, TEST, QA, REVIEW]);
        assert!(template.get(PREFLIGHT).unwrap().is_mechanical());
        assert!(template.get(PLAN).unwrap().requires_approval);
    }

    #[test]
    fn test_config_template_replaces_builtin() {
        let config = WorkflowToml::parse(
            r#"
[templates]
bug_fix = ["plan", "dev", "test", "qa"]
"#,
        )
        .unwrap();
        let template = template_for(TaskType::BugFix, &config).unwrap();
        let names: Vec<_> = template.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![PLAN, DEV, TEST, QA]);
        // DESIGN is absent, so DEV falls back to the preceding stage.
        assert_eq!(template.get(DEV).unwrap().rollback_target, None);
        assert_eq!(
            template.get(QA).unwrap().rollback_target.as_deref(),
            Some(DEV)
        );
    }

    #[test]
    fn test_overrides_apply() {
        let config = WorkflowToml::parse(
            r#"
[stages.overrides.QA]
max_retries = 1
requires_approval = true
mechanical = true

[validation.TEST]
requires_approval = true

[validation.TEST.skip_if]
no_files_match = ["src/**"]
"#,
        )
        .unwrap();
        let template = template_for(TaskType::BugFix, &config).unwrap();
        let qa = template.get(QA).unwrap();
        assert_eq!(qa.max_retries, Some(1));
        assert!(qa.requires_approval);
        assert!(qa.is_mechanical());

        let test = template.get(TEST).unwrap();
        assert!(test.requires_approval);
        assert_eq!(
            test.skip_if.as_ref().unwrap().no_files_match,
            vec!["src/**".to_string()]
        );
    }

    #[test]
    fn test_forward_rollback_is_rejected() {
        let config = WorkflowToml::parse(
            r#"
[stages.overrides.DEV]
rollback_target = "QA"
"#,
        )
        .unwrap();
        let err = template_for(TaskType::BugFix, &config).unwrap_err();
        assert!(matches!(err, ConfigError::ForwardRollback { .. }));
    }

    #[test]
    fn test_self_rollback_is_rejected() {
        let template = WorkflowTemplate {
            task_type: TaskType::Chore,
            stages: vec![StageSpec::backend(DEV).rolls_back_to(DEV)],
        };
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let config = WorkflowToml::parse(
            r#"
[ai.stage_backends]
DEV = "nonexistent"
"#,
        )
        .unwrap();
        let err = template_for(TaskType::Hotfix, &config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }

    #[test]
    fn test_unknown_stage_name_becomes_backend_stage() {
        let config = WorkflowToml::parse(
            r#"
[templates]
chore = ["PLAN", "BENCHMARK"]
"#,
        )
        .unwrap();
        let template = template_for(TaskType::Chore, &config).unwrap();
        let bench = template.get("BENCHMARK").unwrap();
        assert_eq!(bench.kind, StageKind::Backend);
        assert!(!bench.required);
    }
}
