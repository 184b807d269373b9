use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository};
use std::path::{Path, PathBuf};

use super::ChangeSource;
use crate::config::STATE_DIR;

/// Changed files in a git working tree relative to a base commit.
///
/// Untracked files count as changes. The repository is reopened per query so the
/// tracker can be shared across threads.
#[derive(Debug, Clone)]
pub struct GitTracker {
    project_dir: PathBuf,
    base_commit: Option<String>,
}

impl GitTracker {
    pub fn new(project_dir: &Path, base_commit: Option<String>) -> Result<Self> {
        Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            base_commit,
        })
    }

    /// Current HEAD SHA (None for unborn branches or non-repositories)
    pub fn head_sha(project_dir: &Path) -> Option<String> {
        let repo = Repository::open(project_dir).ok()?;
        let head = repo.head().ok()?;
        let commit = head.peel_to_commit().ok()?;
        Some(commit.id().to_string())
    }

    fn compute(&self) -> Result<Vec<String>> {
        let repo = Repository::open(&self.project_dir).context("Failed to open git repository")?;

        let base_tree = match self.base_commit {
            Some(ref sha) => {
                let oid = git2::Oid::from_str(sha)
                    .with_context(|| format!("Invalid base commit '{}'", sha))?;
                Some(repo.find_commit(oid)?.tree()?)
            }
            None => repo
                .head()
                .ok()
                .and_then(|head| head.peel_to_tree().ok()),
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        opts.recurse_untracked_dirs(true);

        let diff = repo.diff_tree_to_workdir_with_index(base_tree.as_ref(), Some(&mut opts))?;

        let mut files = Vec::new();
        for delta in diff.deltas() {
            if !matches!(
                delta.status(),
                Delta::Added
                    | Delta::Untracked
                    | Delta::Modified
                    | Delta::Deleted
                    | Delta::Renamed
                    | Delta::Copied
            ) {
                continue;
            }
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_string_lossy().replace('\\', "/");
            if path.starts_with(&format!("{}/", STATE_DIR)) {
                continue;
            }
            files.push(path);
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}

impl ChangeSource for GitTracker {
    fn changed_files(&self) -> Result<Vec<String>> {
        self.compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        dir
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        let file_path = dir.join(name);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&file_path, content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn test_head_sha_unborn_then_populated() {
        let dir = setup_repo();
        assert!(GitTracker::head_sha(dir.path()).is_none());
        commit_file(dir.path(), "a.txt", "hello", "init");
        assert_eq!(GitTracker::head_sha(dir.path()).unwrap().len(), 40);
    }

    #[test]
    fn test_non_repository_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(GitTracker::new(dir.path(), None).is_err());
        assert!(GitTracker::head_sha(dir.path()).is_none());
    }

    #[test]
    fn test_detects_untracked_nested_file() {
        let dir = setup_repo();
        commit_file(dir.path(), "existing.txt", "original", "init");
        let base = GitTracker::head_sha(dir.path());
        fs::create_dir_all(dir.path().join("src/migrations")).unwrap();
        fs::write(dir.path().join("src/migrations/0001.sql"), "create table t();").unwrap();

        let tracker = GitTracker::new(dir.path(), base).unwrap();
        assert_eq!(
            tracker.changed_files().unwrap(),
            vec!["src/migrations/0001.sql".to_string()]
        );
    }

    #[test]
    fn test_detects_committed_changes_since_base() {
        let dir = setup_repo();
        commit_file(dir.path(), "app.py", "print(1)\n", "init");
        let base = GitTracker::head_sha(dir.path());
        commit_file(dir.path(), "app.py", "print(2)\n", "change");

        let tracker = GitTracker::new(dir.path(), base).unwrap();
        assert_eq!(tracker.changed_files().unwrap(), vec!["app.py".to_string()]);
    }

    #[test]
    fn test_ignores_state_directory() {
        let dir = setup_repo();
        commit_file(dir.path(), "stable.txt", "unchanged\n", "init");
        fs::create_dir_all(dir.path().join(".stagehand/tasks")).unwrap();
        fs::write(dir.path().join(".stagehand/tasks/x.json"), "{}").unwrap();

        let tracker = GitTracker::new(dir.path(), GitTracker::head_sha(dir.path())).unwrap();
        assert!(tracker.changed_files().unwrap().is_empty());
    }
}
