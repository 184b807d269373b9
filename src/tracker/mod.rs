//! Sources of the changed-file set used by file-diff skip conditions.

pub mod git;

use anyhow::Result;
use std::path::Path;

pub use git::GitTracker;

/// Produces the project's current changed-file set, as paths relative to the project
/// root with `/` separators.
pub trait ChangeSource: Send + Sync {
    fn changed_files(&self) -> Result<Vec<String>>;
}

/// A fixed change set.
#[derive(Debug, Clone, Default)]
pub struct StaticChanges(pub Vec<String>);

impl ChangeSource for StaticChanges {
    fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Git-backed change source when `project_dir` is a repository, otherwise an empty set.
pub fn detect(project_dir: &Path, base_commit: Option<String>) -> Box<dyn ChangeSource> {
    match GitTracker::new(project_dir, base_commit) {
        Ok(tracker) => Box::new(tracker),
        Err(e) => {
            tracing::debug!(error = %e, "No git repository; file-diff conditions see no changes");
            Box::new(StaticChanges::default())
        }
    }
}
