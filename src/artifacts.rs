//! Artifact files in a task's artifact directory.
//!
//! Besides plain read/write helpers this owns the two artifacts the orchestrator
//! writes itself: the rollback log (`ROLLBACK.md`, archived into
//! `ROLLBACK_RESOLVED.md` once the implementation stage succeeds again) and
//! `<STAGE>_SKIP.md` records for skipped stages.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const ROLLBACK_FILE: &str = "ROLLBACK.md";
pub const ROLLBACK_RESOLVED_FILE: &str = "ROLLBACK_RESOLVED.md";

/// Files in the task directory that belong to the orchestrator, not to stages.
pub const RESERVED: &[&str] = &[
    "task.json",
    "control.json",
    "control.json.taken",
    ".lock",
    "logs",
];

/// Whether `name` points into orchestrator-owned state: a reserved entry or one of
/// the store's in-flight temp files.
pub fn is_reserved(name: &str) -> bool {
    let first = name.split(['/', '\\']).next().unwrap_or(name);
    RESERVED.contains(&first) || first.starts_with(".tmp")
}

pub fn artifact_path(artifact_dir: &Path, name: &str) -> PathBuf {
    artifact_dir.join(name)
}

pub fn artifact_exists(artifact_dir: &Path, name: &str) -> bool {
    artifact_path(artifact_dir, name).exists()
}

pub fn read_artifact(artifact_dir: &Path, name: &str) -> Result<Option<String>> {
    let path = artifact_path(artifact_dir, name);
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(&path)
        .map(Some)
        .with_context(|| format!("Failed to read artifact {}", path.display()))
}

/// Write an artifact, creating parent directories for nested names.
pub fn write_artifact(artifact_dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = artifact_path(artifact_dir, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write artifact {}", path.display()))?;
    Ok(path)
}

/// Modification times of every stage artifact currently in the directory.
pub fn snapshot(artifact_dir: &Path) -> Result<BTreeMap<String, std::time::SystemTime>> {
    let mut files = BTreeMap::new();
    if !artifact_dir.is_dir() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(artifact_dir)
        .with_context(|| format!("Failed to list {}", artifact_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_reserved(&name) {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            files.insert(name, meta.modified()?);
        }
    }
    Ok(files)
}

/// Artifacts created or modified since `before` was taken.
pub fn produced_since(
    artifact_dir: &Path,
    before: &BTreeMap<String, std::time::SystemTime>,
) -> Result<BTreeMap<String, PathBuf>> {
    let after = snapshot(artifact_dir)?;
    Ok(after
        .into_iter()
        .filter(|(name, modified)| before.get(name) != Some(modified))
        .map(|(name, _)| {
            let path = artifact_dir.join(&name);
            (name, path)
        })
        .collect())
}

/// One rollback, as written to `ROLLBACK.md`.
#[derive(Debug, Clone)]
pub struct RollbackEntry<'a> {
    /// What triggered it, e.g. "Validation failure" or "Operator interrupt"
    pub source: &'a str,
    pub from_stage: &'a str,
    pub target_stage: &'a str,
    pub issues: &'a str,
    /// Attempt number the target stage will run as
    pub target_attempt: u32,
    pub at: DateTime<Utc>,
}

/// Append an entry to `ROLLBACK.md`, creating it with a header if absent.
pub fn append_rollback_entry(artifact_dir: &Path, entry: &RollbackEntry<'_>) -> Result<PathBuf> {
    let section = format!(
        "\n---\n\n## {}\n\n**Date:** {}\n**From Stage:** {}\n**Target Stage:** {}\n\
         **Target Attempt:** {}\n\n### Issues to Fix\n{}\n",
        entry.source,
        entry.at.to_rfc3339(),
        entry.from_stage,
        entry.target_stage,
        entry.target_attempt,
        entry.issues.trim_end(),
    );

    let content = match read_artifact(artifact_dir, ROLLBACK_FILE)? {
        Some(existing) => existing + &section,
        None => format!(
            "# Rollback Log\n\nThis file tracks issues that required rolling back to earlier \
             stages.\n{}",
            section
        ),
    };
    write_artifact(artifact_dir, ROLLBACK_FILE, &content)
}

/// Move `ROLLBACK.md` into `ROLLBACK_RESOLVED.md` with a resolution timestamp.
///
/// Returns false when there was nothing to archive.
pub fn archive_rollback(artifact_dir: &Path) -> Result<bool> {
    let Some(rollback) = read_artifact(artifact_dir, ROLLBACK_FILE)? else {
        return Ok(false);
    };

    let resolved = format!(
        "{}\n\n**Resolved:** {}\n",
        rollback.trim_end(),
        Utc::now().to_rfc3339()
    );
    let content = match read_artifact(artifact_dir, ROLLBACK_RESOLVED_FILE)? {
        Some(existing) => format!("{}\n\n---\n\n{}", existing.trim_end(), resolved),
        None => resolved,
    };
    write_artifact(artifact_dir, ROLLBACK_RESOLVED_FILE, &content)?;

    let path = artifact_path(artifact_dir, ROLLBACK_FILE);
    std::fs::remove_file(&path)
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    Ok(true)
}

pub fn skip_artifact_name(stage: &str) -> String {
    format!("{}_SKIP.md", stage.to_uppercase())
}

/// Record why a stage was skipped.
pub fn write_skip_artifact(
    artifact_dir: &Path,
    stage: &str,
    reason: &str,
    note: Option<&str>,
) -> Result<PathBuf> {
    let mut content = format!(
        "# {} Skipped\n\n**Date:** {}\n\n## Reason\n{}\n",
        stage,
        Utc::now().to_rfc3339(),
        reason
    );
    if let Some(note) = note {
        content.push_str(&format!("\n## Note\n{}\n", note));
    }
    write_artifact(artifact_dir, &skip_artifact_name(stage), &content)
}
