//! Stage graph resolution.
//!
//! Merges a `WorkflowTemplate` with the configuration skip list and a stage plan into
//! the effective sequence for one task. File-diff conditions are not decided here:
//! each `ResolvedStage` keeps its condition and is decided with `decide` right before
//! the stage would run, against the changed-file set at that moment.
//!
//! Precedence, highest first:
//! 1. `stages.skip` in configuration (hard removal)
//! 2. a dynamic plan recommendation (`skip` skips, `run` suppresses the file-diff check)
//! 3. the stage's `skip_if.no_files_match` condition
//!
//! Required stages ignore 2 and 3.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::ConfigError;
use crate::stage::{StageSpec, WorkflowTemplate, known_stage_names};
use crate::workflow_config::{SkipIf, WorkflowToml};

/// File the planning stage writes its recommendations to.
pub const STAGE_PLAN_FILE: &str = "STAGE_PLAN.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipSource {
    TaskType,
    Config,
    DynamicRecommendation,
    FileDiff,
}

impl std::fmt::Display for SkipSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipSource::TaskType => "task type",
            SkipSource::Config => "configuration",
            SkipSource::DynamicRecommendation => "stage plan",
            SkipSource::FileDiff => "file-diff condition",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRule {
    pub source: SkipSource,
    pub stage: String,
    pub reason: String,
}

impl SkipRule {
    fn new(source: SkipSource, stage: &str, reason: impl Into<String>) -> Self {
        Self {
            source,
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Skip,
    Run,
}

/// One dynamic recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub stage: String,
    pub action: PlanAction,
    #[serde(default)]
    pub reason: String,
}

/// Dynamic stage recommendations, from the caller or from `STAGE_PLAN.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagePlan {
    pub entries: Vec<PlanEntry>,
}

impl StagePlan {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }

    /// Read `STAGE_PLAN.json` from an artifact directory; absent means empty.
    pub fn load(artifact_dir: &Path) -> Result<Self> {
        let path = artifact_dir.join(STAGE_PLAN_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let plan: StagePlan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(plan)
    }

    /// Caller entries take precedence over artifact entries for the same stage.
    pub fn merged(caller: &[PlanEntry], artifact: StagePlan) -> Self {
        let mut entries: Vec<PlanEntry> = caller.to_vec();
        for entry in artifact.entries {
            if !entries.iter().any(|e| e.stage.eq_ignore_ascii_case(&entry.stage)) {
                entries.push(entry);
            }
        }
        Self { entries }
    }

    /// Last entry for `stage` wins.
    pub fn recommendation(&self, stage: &str) -> Option<&PlanEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.stage.eq_ignore_ascii_case(stage))
    }
}

/// One stage of the resolved sequence with its statically known inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStage {
    pub spec: StageSpec,
    /// Skip decided at resolution time (configuration)
    pub hard_skip: Option<SkipRule>,
    pub recommendation: Option<PlanEntry>,
}

/// Final decision for a stage about to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDecision {
    Run { note: Option<String> },
    Skip { rule: SkipRule, note: Option<String> },
}

impl StageDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, StageDecision::Skip { .. })
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            StageDecision::Run { note } | StageDecision::Skip { note, .. } => note.as_deref(),
        }
    }
}

impl ResolvedStage {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Decide whether the stage runs given the current changed-file set.
    pub fn decide(&self, changed_files: &[String]) -> Result<StageDecision, ConfigError> {
        if let Some(ref rule) = self.hard_skip {
            return Ok(StageDecision::Skip {
                rule: rule.clone(),
                note: None,
            });
        }

        let name = self.name();
        let file_diff_skip = match self.spec.skip_if {
            Some(ref cond) => no_files_match(cond, changed_files)?,
            None => false,
        };

        if self.spec.required {
            let note = match self.recommendation {
                Some(ref rec) if rec.action == PlanAction::Skip => {
                    Some(format!("{} is required; stage plan skip ignored", name))
                }
                _ => None,
            };
            return Ok(StageDecision::Run { note });
        }

        match self.recommendation {
            Some(ref rec) if rec.action == PlanAction::Skip => {
                let note = (self.spec.skip_if.is_some() && !file_diff_skip).then(|| {
                    format!(
                        "conflict: changed files match {}'s skip_if globs but the stage plan \
                         recommends skipping",
                        name
                    )
                });
                Ok(StageDecision::Skip {
                    rule: SkipRule::new(
                        SkipSource::DynamicRecommendation,
                        name,
                        non_empty(&rec.reason, "stage plan recommends skipping"),
                    ),
                    note,
                })
            }
            Some(ref rec) if rec.action == PlanAction::Run => {
                let note = file_diff_skip.then(|| {
                    format!(
                        "conflict: no changed files match {}'s skip_if globs but the stage plan \
                         requires it to run",
                        name
                    )
                });
                Ok(StageDecision::Run { note })
            }
            _ if file_diff_skip => {
                let globs = self
                    .spec
                    .skip_if
                    .as_ref()
                    .map(|c| c.no_files_match.join(", "))
                    .unwrap_or_default();
                Ok(StageDecision::Skip {
                    rule: SkipRule::new(
                        SkipSource::FileDiff,
                        name,
                        format!("no changed files match [{}]", globs),
                    ),
                    note: None,
                })
            }
            _ => Ok(StageDecision::Run { note: None }),
        }
    }
}

fn non_empty(s: &str, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

/// The effective sequence for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSequence {
    pub stages: Vec<ResolvedStage>,
    /// Catalog stages this task type does not include
    pub task_type_skips: Vec<SkipRule>,
}

impl ResolvedSequence {
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == stage)
    }

    pub fn get(&self, stage: &str) -> Option<&ResolvedStage> {
        self.stages.iter().find(|s| s.name() == stage)
    }

    pub fn first(&self) -> Option<&ResolvedStage> {
        self.stages.first()
    }

    /// Stage after `stage` in sequence order.
    pub fn next_after(&self, stage: &str) -> Option<&ResolvedStage> {
        self.position(stage).and_then(|idx| self.stages.get(idx + 1))
    }

    /// Nearest stage before `stage` that configuration does not remove.
    pub fn previous_before(&self, stage: &str) -> Option<&ResolvedStage> {
        let idx = self.position(stage)?;
        self.stages[..idx].iter().rev().find(|s| s.hard_skip.is_none())
    }

    /// Names of the stages from `from` (inclusive) to `to` (inclusive).
    pub fn span(&self, from: &str, to: &str) -> Vec<String> {
        match (self.position(from), self.position(to)) {
            (Some(a), Some(b)) if a <= b => self.stages[a..=b]
                .iter()
                .map(|s| s.name().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Rollback target for a failing stage.
    ///
    /// The configured target is used when it is strictly earlier and not hard-skipped;
    /// otherwise the nearest earlier stage that is not hard-skipped. `None` means the
    /// failing stage is effectively first.
    pub fn rollback_target_for(&self, failing: &str) -> Option<String> {
        let failing_idx = self.position(failing)?;
        let runnable_before =
            |stage: &str| self.previous_before(stage).map(|s| s.name().to_string());

        if let Some(ref target) = self.stages[failing_idx].spec.rollback_target
            && let Some(target_idx) = self.position(target)
            && target_idx < failing_idx
        {
            if self.stages[target_idx].hard_skip.is_none() {
                return Some(target.clone());
            }
            if let Some(found) = runnable_before(target) {
                return Some(found);
            }
        }
        runnable_before(failing)
    }
}

/// Resolve the effective stage sequence. Pure and deterministic.
pub fn resolve(
    template: &WorkflowTemplate,
    config: &WorkflowToml,
    plan: &StagePlan,
) -> ResolvedSequence {
    let stages = template
        .stages
        .iter()
        .map(|spec| {
            let hard_skip = config.stages.is_skipped(&spec.name).then(|| {
                SkipRule::new(SkipSource::Config, &spec.name, "listed in stages.skip")
            });
            ResolvedStage {
                spec: spec.clone(),
                hard_skip,
                recommendation: plan.recommendation(&spec.name).cloned(),
            }
        })
        .collect();

    let task_type_skips = known_stage_names()
        .into_iter()
        .filter(|name| template.position(name).is_none())
        .map(|name| {
            SkipRule::new(
                SkipSource::TaskType,
                name,
                format!("not part of the {} workflow", template.task_type),
            )
        })
        .collect();

    ResolvedSequence {
        stages,
        task_type_skips,
    }
}

/// Whether `pattern` matches `path` or any suffix of it starting at a path component,
/// so `migrations/**` matches `src/migrations/0001.sql`.
pub fn glob_matches(pattern: &glob::Pattern, path: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let path = path.trim_start_matches("./");
    if pattern.matches_with(path, options) {
        return true;
    }
    path.match_indices('/')
        .any(|(idx, _)| pattern.matches_with(&path[idx + 1..], options))
}

/// True when no changed file matches any of the condition's globs.
pub fn no_files_match(cond: &SkipIf, changed_files: &[String]) -> Result<bool, ConfigError> {
    let patterns = cond
        .no_files_match
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| ConfigError::InvalidGlob {
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(!changed_files
        .iter()
        .any(|file| patterns.iter().any(|p| glob_matches(p, file))))
}
