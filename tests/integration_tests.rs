//! CLI integration tests for the `fanout` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A fanout command isolated from the caller's environment.
fn fanout(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("fanout");
    cmd.current_dir(dir.path())
        .env_remove("FANOUT_CONFIG")
        .env_remove("FANOUT_OUTPUT_BASE")
        .env_remove("FANOUT_BACKEND")
        .env_remove("FANOUT_CALLBACK_URL")
        .env_remove("JOB_GROUP_ID")
        .env_remove("AGENT_ID")
        .env_remove("AGENT_ROLE")
        .env_remove("RUST_LOG");
    cmd
}

const COMMIT_EVENT: &str =
    r#"{"tool_name":"Bash","tool_input":{"command":"git add -A && git commit -m 'done'"}}"#;

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("hook"))
            .stdout(predicate::str::contains("reap"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("fanout"));
    }
}

mod hook {
    use super::*;

    #[test]
    fn test_non_commit_event_is_ignored() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .arg("hook")
            .write_stdin(r#"{"tool_name":"Bash","tool_input":{"command":"cargo test"}}"#)
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn test_garbage_input_still_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .arg("hook")
            .write_stdin("not json at all")
            .assert()
            .success();
    }

    #[test]
    fn test_commit_without_job_environment_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .arg("hook")
            .write_stdin(COMMIT_EVENT)
            .assert()
            .success()
            .stderr(predicate::str::contains("JOB_GROUP_ID"));
    }

    #[test]
    fn test_unreachable_orchestrator_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .args(["hook", "--stage", "worker"])
            .env("JOB_GROUP_ID", "ab12cd34")
            .env("AGENT_ID", "0")
            .env("FANOUT_CALLBACK_URL", "http://127.0.0.1:9")
            .write_stdin(COMMIT_EVENT)
            .assert()
            .success();
    }
}

mod config {
    use super::*;

    #[test]
    fn test_show_defaults() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("max_agents = 10"))
            .stdout(predicate::str::contains("mcp-worker:latest"));
    }

    #[test]
    fn test_file_and_env_layers() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fanout.toml"),
            "[runs]\nmax_agents = 4\n\n[jobs]\nimage = \"agent:dev\"\n",
        )
        .unwrap();

        fanout(&dir)
            .args(["config", "show"])
            .env("FANOUT_OUTPUT_BASE", "/srv/fanout-output")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_agents = 4"))
            .stdout(predicate::str::contains("agent:dev"))
            .stdout(predicate::str::contains("/srv/fanout-output"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fanout.toml"),
            "[jobs.resources]\ncpu_request = \"4\"\ncpu_limit = \"2\"\n",
        )
        .unwrap();

        fanout(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("exceeds cpu_limit"));
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .args(["--config", "missing.toml", "config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("missing.toml"));
    }
}

mod serve {
    use super::*;

    #[test]
    fn test_unknown_backend_is_rejected_before_binding() {
        let dir = TempDir::new().unwrap();
        fanout(&dir)
            .args(["serve", "--backend", "kubernetes", "--port", "0"])
            .env("FANOUT_OUTPUT_BASE", dir.path().join("out"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid backend"));
    }
}
