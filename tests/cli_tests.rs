//! CLI tests for the stagehand binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn stagehand() -> Command {
    let mut cmd = cargo_bin_cmd!("stagehand");
    cmd.env_remove("STAGEHAND_HUB_URL").env_remove("STAGEHAND_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    stagehand()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

/// Point every stage at a backend that just consumes its payload.
fn configure_fake_backend(dir: &TempDir, extra: &str) {
    let script = dir.path().join("backend.sh");
    fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho \"ran $STAGEHAND_STAGE\"\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }
    fs::write(
        dir.path().join(".stagehand/stagehand.toml"),
        format!(
            "[ai]\ndefault_backend = \"fake\"\n\n[ai.backends.fake]\ncommand = \"{}\"\n\n\
             [templates]\nchore = [\"PLAN\", \"DEV\"]\n\n{}",
            script.display(),
            extra
        ),
    )
    .unwrap();
}

fn only_task_id(dir: &Path) -> String {
    let tasks = dir.join(".stagehand/tasks");
    let ids: Vec<String> = fs::read_dir(&tasks)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name != "done")
        .collect();
    assert_eq!(ids.len(), 1, "expected one active task, found {:?}", ids);
    ids[0].clone()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        stagehand()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"))
            .stdout(predicate::str::contains("approve"));
    }

    #[test]
    fn test_version() {
        stagehand().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();
        stagehand()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized stagehand project"));

        assert!(dir.path().join(".stagehand/tasks/done").is_dir());
        assert!(dir.path().join(".stagehand/logs").is_dir());
        assert!(dir.path().join(".stagehand/stagehand.toml").is_file());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_commands_require_init() {
        let dir = TempDir::new().unwrap();
        stagehand()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("not initialized"));
    }

    #[test]
    fn test_list_empty() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks"));
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .args(["start", "tidy", "--type", "spike"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown task type 'spike'"));
    }
}

mod workflow {
    use super::*;

    #[test]
    fn test_start_runs_task_to_completion() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_fake_backend(&dir, "[stages.overrides.PLAN]\nrequires_approval = false\n");

        stagehand()
            .current_dir(dir.path())
            .args(["start", "tidy imports", "--type", "chore"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created task tidy-imports-"))
            .stdout(predicate::str::contains("complete"));

        stagehand()
            .current_dir(dir.path())
            .args(["list", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tidy-imports-"))
            .stdout(predicate::str::contains("complete"));
    }

    #[test]
    fn test_gate_approve_then_resume() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_fake_backend(&dir, "");

        stagehand()
            .current_dir(dir.path())
            .args(["start", "tidy", "--type", "chore", "--no-wait"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PLAN is waiting for approval"));

        let id = only_task_id(dir.path());
        stagehand()
            .current_dir(dir.path())
            .args(["status", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("waiting_approval"))
            .stdout(predicate::str::contains("stagehand approve"));

        stagehand()
            .current_dir(dir.path())
            .args(["approve", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("approve applied"));

        stagehand()
            .current_dir(dir.path())
            .args(["resume", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("Task {} complete", id)));
    }

    #[test]
    fn test_reject_requires_waiting_task() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_fake_backend(&dir, "[stages.overrides.PLAN]\nrequires_approval = false\n");
        stagehand()
            .current_dir(dir.path())
            .args(["start", "tidy", "--type", "chore"])
            .assert()
            .success();

        let done = dir.path().join(".stagehand/tasks/done");
        let id = fs::read_dir(&done)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .file_name()
            .to_string_lossy()
            .to_string();
        stagehand()
            .current_dir(dir.path())
            .args(["reject", &id, "--reason", "too broad"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not waiting for approval"));
    }

    #[test]
    fn test_abandon_with_yes() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_fake_backend(&dir, "");
        stagehand()
            .current_dir(dir.path())
            .args(["start", "tidy", "--type", "chore", "--no-wait"])
            .assert()
            .success();
        let id = only_task_id(dir.path());

        stagehand()
            .current_dir(dir.path())
            .args(["abandon", &id, "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("abandoned and archived"));
        assert!(dir.path().join(".stagehand/tasks/done").join(&id).is_dir());
    }

    #[test]
    fn test_unskip_checks_stage_belongs_to_workflow() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_fake_backend(&dir, "");
        stagehand()
            .current_dir(dir.path())
            .args(["start", "tidy", "--type", "chore", "--no-wait"])
            .assert()
            .success();
        let id = only_task_id(dir.path());

        stagehand()
            .current_dir(dir.path())
            .args(["unskip", &id, "QA"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not part of task"));

        stagehand()
            .current_dir(dir.path())
            .args(["unskip", &id, "dev"])
            .assert()
            .success()
            .stdout(predicate::str::contains("unskip applied"));
    }

    #[test]
    fn test_signal_feedback_only_for_interrupt() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .args(["signal", "whatever", "skip", "--feedback", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--feedback only applies to interrupt"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_validate_defaults() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_undefined_backend() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        fs::write(
            dir.path().join(".stagehand/stagehand.toml"),
            "[ai.stage_backends]\nREVIEW = \"codex\"\n",
        )
        .unwrap();
        stagehand()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("codex"));
    }

    #[test]
    fn test_config_show_lists_workflows() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("bug_fix"))
            .stdout(predicate::str::contains("PLAN* -> PREFLIGHT -> DEV"));
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        stagehand()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }
}
