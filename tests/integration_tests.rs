//! Integration tests for the sdlc CLI
//!
//! These drive the real binary against a throwaway SQLite database. None of
//! them reach the agent: every command exercised here fails or finishes
//! before a phase would spawn one.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const MANIFEST: &str = r#"prd: docs/prd.md
repos:
  - name: api
    path: ../api
    team: Core
  - name: web
    path: ../web
    team: Frontend
"#;

/// Helper to create an sdlc Command
fn sdlc() -> Command {
    let mut cmd = cargo_bin_cmd!("sdlc");
    cmd.env_remove("SDLC_DB").env_remove("RUST_LOG");
    cmd
}

/// Helper to run sdlc inside `dir` against `dir/sdlc.db`
fn sdlc_in(dir: &TempDir) -> Command {
    let mut cmd = sdlc();
    cmd.current_dir(dir.path()).arg("--db").arg(db_path(dir));
    cmd
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("sdlc.db")
}

fn write_manifest(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("manifest.yaml");
    fs::write(&path, body).unwrap();
    path
}

/// Create a run and return its id as printed by `sdlc init`.
fn init_run(dir: &TempDir) -> String {
    write_manifest(dir, MANIFEST);
    let output = sdlc_in(dir).arg("init").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("Created run "))
        .map(|id| id.trim().to_string())
        .expect("init prints the run id")
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_sdlc_help() {
        sdlc()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("approve"));
    }

    #[test]
    fn test_sdlc_version() {
        sdlc().arg("--version").assert().success();
    }

    #[test]
    fn test_phase_rejects_malformed_param() {
        let dir = TempDir::new().unwrap();
        sdlc_in(&dir)
            .args(["phase", "design", "--param", "prd"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected key=value"));
    }
}

// =============================================================================
// Run Lifecycle Tests
// =============================================================================

mod run_lifecycle {
    use super::*;

    #[test]
    fn test_status_without_runs_fails() {
        let dir = TempDir::new().unwrap();
        sdlc_in(&dir)
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No runs found"));
    }

    #[test]
    fn test_runs_on_empty_database() {
        let dir = TempDir::new().unwrap();
        sdlc_in(&dir)
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs found"));
    }

    #[test]
    fn test_init_rejects_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "prd: docs/prd.md\nrepos: []\n");
        sdlc_in(&dir)
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("at least one repo is required"));
    }

    #[test]
    fn test_init_missing_manifest_fails() {
        let dir = TempDir::new().unwrap();
        sdlc_in(&dir)
            .args(["init", "nope.yaml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.yaml"));
    }

    #[test]
    fn test_init_then_runs_and_status() {
        let dir = TempDir::new().unwrap();
        let run_id = init_run(&dir);
        assert!(db_path(&dir).exists());

        sdlc_in(&dir)
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains(run_id.as_str()))
            .stdout(predicate::str::contains("docs/prd.md"));

        sdlc_in(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains(run_id.as_str()))
            .stdout(predicate::str::contains("Phase:        init"))
            .stdout(predicate::str::contains("Repos:        2"));
    }

    #[test]
    fn test_second_init_becomes_latest() {
        let dir = TempDir::new().unwrap();
        let first = init_run(&dir);
        let second = init_run(&dir);
        assert_ne!(first, second);

        sdlc_in(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains(second.as_str()));
    }
}

// =============================================================================
// Phase And Gate Tests
// =============================================================================

mod phases {
    use super::*;

    #[test]
    fn test_unknown_phase_is_rejected() {
        let dir = TempDir::new().unwrap();
        init_run(&dir);
        sdlc_in(&dir)
            .args(["phase", "deploy"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown phase: deploy"));
    }

    #[test]
    fn test_approve_without_gate_fails() {
        let dir = TempDir::new().unwrap();
        init_run(&dir);
        sdlc_in(&dir)
            .arg("approve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("no pending approval gate"));
    }
}
