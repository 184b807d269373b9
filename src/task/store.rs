//! Crash-safe task record persistence.
//!
//! Layout under `.stagehand/tasks/`:
//! - `<id>/task.json`: the task record (pretty JSON, schema-versioned)
//! - `<id>/.lock`: advisory lock held by the process driving the task
//! - `done/<id>/`: archived tasks
//!
//! Saves write a temp file in the task directory, fsync it and rename it over
//! `task.json`, so a crash mid-write leaves the previous record intact.

use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{SCHEMA_VERSION, Task};
use crate::config::Config;
use crate::errors::StoreError;

pub const TASK_FILE: &str = "task.json";
const LOCK_FILE: &str = ".lock";

type StoreResult<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Exclusive hold on one task; released on drop.
#[derive(Debug)]
pub struct TaskLock {
    file: File,
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_dir: PathBuf,
    done_dir: PathBuf,
}

impl TaskStore {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        let tasks_dir = tasks_dir.into();
        Self {
            done_dir: tasks_dir.join("done"),
            tasks_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            tasks_dir: config.tasks_dir.clone(),
            done_dir: config.done_dir.clone(),
        }
    }

    pub fn task_dir(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(id)
    }

    fn locate(&self, id: &str) -> Option<PathBuf> {
        [self.tasks_dir.join(id), self.done_dir.join(id)]
            .into_iter()
            .find(|dir| dir.join(TASK_FILE).is_file())
    }

    /// Persist a new task, assigning its artifact directory.
    pub fn create(&self, mut task: Task) -> StoreResult<Task> {
        let dir = self.task_dir(&task.id);
        fs::create_dir_all(dir.join("logs")).map_err(io_err(&dir))?;
        task.artifact_dir = dir;
        self.save(&task)?;
        info!(task = %task.id, task_type = %task.task_type, "Created task");
        Ok(task)
    }

    /// Atomically write the task record.
    pub fn save(&self, task: &Task) -> StoreResult<()> {
        let dir = self
            .locate(&task.id)
            .unwrap_or_else(|| self.task_dir(&task.id));
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let content = serde_json::to_string_pretty(task)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("Failed to serialize task: {}", e)))?;

        let target = dir.join(TASK_FILE);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(content.as_bytes()).map_err(io_err(&target))?;
        tmp.as_file().sync_all().map_err(io_err(&target))?;
        tmp.persist(&target).map_err(|e| StoreError::Io {
            path: target.clone(),
            source: e.error,
        })?;
        debug!(task = %task.id, "Saved task record");
        Ok(())
    }

    /// Load a task by id, migrating older records.
    pub fn load(&self, id: &str) -> StoreResult<Task> {
        let dir = self
            .locate(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        Self::read_record(&dir.join(TASK_FILE))
    }

    fn read_record(path: &Path) -> StoreResult<Task> {
        let content = fs::read_to_string(path).map_err(io_err(path))?;
        let value: Value = serde_json::from_str(&content).map_err(|e| StoreError::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        if version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        let value = if version < 2 {
            migrate_v1_to_v2(value).map_err(|reason| StoreError::CorruptState {
                path: path.to_path_buf(),
                reason,
            })?
        } else {
            value
        };

        serde_json::from_value(value).map_err(|e| StoreError::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load a task for resumption: runs left open by a dead process are reclassified
    /// as interrupted and the repaired record is saved before returning.
    pub fn load_for_resume(&self, id: &str) -> StoreResult<Task> {
        let mut task = self.load(id)?;
        let recovered = task.recover_interrupted();
        if !recovered.is_empty() {
            warn!(
                task = %task.id,
                stages = ?recovered,
                "Reclassified interrupted runs from a previous process"
            );
            self.save(&task)?;
        }
        Ok(task)
    }

    /// All tasks ordered by last activity (most recent first).
    ///
    /// Unreadable records are logged and left out.
    pub fn list(&self, include_archived: bool) -> StoreResult<Vec<Task>> {
        let mut dirs = vec![self.tasks_dir.clone()];
        if include_archived {
            dirs.push(self.done_dir.clone());
        }

        let mut tasks = Vec::new();
        for dir in dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
                let entry = entry.map_err(io_err(&dir))?;
                let path = entry.path().join(TASK_FILE);
                if !path.is_file() {
                    continue;
                }
                match Self::read_record(&path) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable task"),
                }
            }
        }

        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }

    /// Move a task into `done/` and repoint its artifact directory.
    pub fn archive(&self, task: &mut Task) -> StoreResult<()> {
        let from = self.task_dir(&task.id);
        if !from.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.done_dir).map_err(io_err(&self.done_dir))?;
        let to = self.done_dir.join(&task.id);
        fs::rename(&from, &to).map_err(io_err(&from))?;
        task.artifact_dir = to;
        task.touch();
        self.save(task)?;
        info!(task = %task.id, "Archived task");
        Ok(())
    }

    /// Take the single-writer lock for a task without blocking.
    pub fn lock(&self, id: &str) -> StoreResult<TaskLock> {
        let dir = self
            .locate(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked { id: id.to_string() })?;
        Ok(TaskLock { file })
    }
}

/// Upgrade a version-1 record.
///
/// Version 1 kept history under `stage_history` and had no attempt ledger; the ledger
/// is rebuilt from the runs recorded since each stage's last success.
pub fn migrate_v1_to_v2(mut value: Value) -> std::result::Result<Value, String> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| "task record is not a JSON object".to_string())?;

    if let Some(history) = obj.remove("stage_history") {
        obj.insert("history".to_string(), history);
    }

    let mut attempts = serde_json::Map::new();
    if let Some(history) = obj.get("history").and_then(Value::as_array) {
        for run in history {
            let Some(stage) = run.get("stage").and_then(Value::as_str) else {
                return Err("history entry without a stage".to_string());
            };
            let status = run.get("status").and_then(Value::as_str).unwrap_or("");
            let entry = attempts
                .entry(stage.to_string())
                .or_insert_with(|| serde_json::json!({"runs": 0, "failures": 0, "settled": false}));
            let settled = entry["settled"].as_bool().unwrap_or(false);
            let mut runs = if settled { 0 } else { entry["runs"].as_u64().unwrap_or(0) };
            let mut failures = if settled {
                0
            } else {
                entry["failures"].as_u64().unwrap_or(0)
            };
            if status != "skipped" {
                runs += 1;
            }
            if status == "failed" {
                failures += 1;
            }
            *entry = serde_json::json!({
                "runs": runs,
                "failures": failures,
                "settled": status == "succeeded",
            });
        }
    }
    obj.entry("attempts").or_insert(Value::Object(attempts));
    obj.insert("schema_version".to_string(), Value::from(2u32));
    Ok(value)
}
