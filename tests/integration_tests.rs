//! Integration tests for the `hive` binary.
//!
//! Runs use a tiny shell script as the LLM backend so whole workflows can
//! execute without any network access.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn hive() -> Command {
    let mut cmd = cargo_bin_cmd!("hive");
    cmd.env_remove("HIVE_MAX_ATTEMPTS")
        .env_remove("HIVE_BUILD_CMD")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_hive_project(dir: &TempDir) {
    hive().current_dir(dir.path()).arg("init").assert().success();
}

/// Point every agent at `script`, run as `sh <script> <prompt>`.
fn use_fake_backend(dir: &Path, script: &str) {
    let script_path = dir.join("fake-llm.sh");
    fs::write(&script_path, script).unwrap();
    let toml = format!(
        r#"[defaults]
backend = "fake"
max_attempts = 1
timeout_secs = 30

[backends.fake]
cmd = "sh"
args = ["{}"]
prompt_input = "arg"
output = "text"
"#,
        script_path.display()
    );
    fs::write(dir.join(".hive/hive.toml"), toml).unwrap();
}

const COMPLETE_SCRIPT: &str = r#"#!/bin/sh
echo "Implemented the change."
echo "HIVE_REPORT"
echo '{"status": "complete", "confidence": 0.95, "notes": "done"}'
echo "END_HIVE_REPORT"
"#;

/// Asks a question on the first call, completes afterwards.
const ASK_ONCE_SCRIPT: &str = r#"#!/bin/sh
marker="$(dirname "$0")/asked"
if [ ! -f "$marker" ]; then
  touch "$marker"
  echo "HIVE_REPORT"
  echo '{"status": "needs_input", "confidence": 0.6, "question": "Which database?", "key": "db", "default": "sqlite"}'
  echo "END_HIVE_REPORT"
  exit 0
fi
echo "HIVE_REPORT"
echo '{"status": "complete", "confidence": 0.9}'
echo "END_HIVE_REPORT"
"#;

mod cli_basics {
    use super::*;

    #[test]
    fn test_hive_help() {
        hive()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resume"));
    }

    #[test]
    fn test_hive_version() {
        hive().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        hive()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized hive project"));

        for sub in ["agents", "workflows", "runs", "logs"] {
            assert!(dir.path().join(".hive").join(sub).is_dir(), "missing .hive/{}", sub);
        }
        assert!(dir.path().join(".hive/hive.toml").exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = create_temp_project();
        init_hive_project(&dir);

        hive()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_run_requires_init() {
        let dir = create_temp_project();

        hive()
            .current_dir(dir.path())
            .args(["run", "add a spinner"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not initialized"));
    }

    #[test]
    fn test_status_without_runs() {
        let dir = create_temp_project();
        init_hive_project(&dir);

        hive()
            .current_dir(dir.path())
            .args(["status", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs yet"));
    }
}

mod workflows {
    use super::*;

    #[test]
    fn test_lists_builtin_workflows() {
        let dir = create_temp_project();
        init_hive_project(&dir);

        hive()
            .current_dir(dir.path())
            .arg("workflows")
            .assert()
            .success()
            .stdout(predicate::str::contains("full"))
            .stdout(predicate::str::contains("quick"));
    }

    #[test]
    fn test_lists_project_workflow() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        fs::write(
            dir.path().join(".hive/workflows/docs-only.yaml"),
            "name: docs-only\ndescription: Just documentation\nphases:\n  - agent: documenter\n",
        )
        .unwrap();

        hive()
            .current_dir(dir.path())
            .arg("workflows")
            .assert()
            .success()
            .stdout(predicate::str::contains("docs-only"));
    }

    #[test]
    fn test_unknown_workflow_fails() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        use_fake_backend(dir.path(), COMPLETE_SCRIPT);

        hive()
            .current_dir(dir.path())
            .args(["run", "anything", "--workflow", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let dir = create_temp_project();
        init_hive_project(&dir);

        hive()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_validate_rejects_broken_toml() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        fs::write(dir.path().join(".hive/hive.toml"), "[defaults\nbackend = ").unwrap();

        hive()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();
    }

    #[test]
    fn test_show_lists_backend() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        use_fake_backend(dir.path(), COMPLETE_SCRIPT);

        hive()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fake"));
    }
}

mod runs {
    use super::*;

    #[test]
    fn test_quick_run_completes() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        use_fake_backend(dir.path(), COMPLETE_SCRIPT);

        hive()
            .current_dir(dir.path())
            .args(["run", "add a loading spinner", "--workflow", "quick"])
            .assert()
            .success();

        hive()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("complete"))
            .stdout(predicate::str::contains("add a loading spinner"));

        hive()
            .current_dir(dir.path())
            .arg("events")
            .assert()
            .success()
            .stdout(predicate::str::contains("run_started"))
            .stdout(predicate::str::contains("phase_completed"))
            .stdout(predicate::str::contains("run_completed"));

        hive()
            .current_dir(dir.path())
            .args(["events", "--agent", "implementer", "-n", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("implementer"));

        let runs: Vec<_> = fs::read_dir(dir.path().join(".hive/runs")).unwrap().collect();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn test_needs_input_pauses_then_resumes() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        use_fake_backend(dir.path(), ASK_ONCE_SCRIPT);

        hive()
            .current_dir(dir.path())
            .args(["run", "add caching", "--workflow", "quick"])
            .assert()
            .code(3);

        hive()
            .current_dir(dir.path())
            .arg("checkpoints")
            .assert()
            .success()
            .stdout(predicate::str::contains("open"));

        hive()
            .current_dir(dir.path())
            .args(["resume", "--decision", "continue"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Which database?"));

        hive()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("complete"))
            .stdout(predicate::str::contains("sqlite"));

        // Nothing is left to resume.
        hive()
            .current_dir(dir.path())
            .args(["resume", "--decision", "continue"])
            .assert()
            .failure();
    }

    #[test]
    fn test_auto_applies_default() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        use_fake_backend(dir.path(), ASK_ONCE_SCRIPT);

        hive()
            .current_dir(dir.path())
            .args(["run", "add caching", "--workflow", "quick", "--auto"])
            .assert()
            .success();

        hive()
            .current_dir(dir.path())
            .arg("events")
            .assert()
            .success()
            .stdout(predicate::str::contains("default_applied"))
            .stdout(predicate::str::contains("db = sqlite"));
    }

    #[test]
    fn test_failing_backend_fails_run() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        use_fake_backend(dir.path(), "#!/bin/sh\necho broken >&2\nexit 2\n");

        hive()
            .current_dir(dir.path())
            .args(["run", "add caching", "--workflow", "quick"])
            .assert()
            .code(1);

        hive()
            .current_dir(dir.path())
            .arg("events")
            .assert()
            .success()
            .stdout(predicate::str::contains("invocation_failed"))
            .stdout(predicate::str::contains("run_failed"));
    }

    #[test]
    fn test_comb_without_tracker_tasks() {
        let dir = create_temp_project();
        init_hive_project(&dir);
        let tracker = dir.path().join("tracker.sh");
        fs::write(&tracker, "#!/bin/sh\necho '[]'\n").unwrap();
        let toml = format!(
            "[tracker]\ncmd = \"sh\"\nready_args = [\"{0}\"]\nblocked_args = [\"{0}\"]\n",
            tracker.display()
        );
        fs::write(dir.path().join(".hive/hive.toml"), toml).unwrap();

        hive()
            .current_dir(dir.path())
            .arg("comb")
            .assert()
            .success()
            .stdout(predicate::str::contains("No ready tasks"));
    }
}
