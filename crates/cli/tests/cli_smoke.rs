//! Smoke tests for the retrace binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn retrace(build_dir: &TempDir, work_dir: &TempDir) -> Command {
  let mut cmd = Command::cargo_bin("retrace").unwrap();
  cmd
    .env("RETRACE_DIR", build_dir.path())
    .current_dir(work_dir.path());
  cmd
}

#[test]
fn help_lists_subcommands() {
  Command::cargo_bin("retrace")
    .unwrap()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("build"))
    .stdout(predicate::str::contains("check"))
    .stdout(predicate::str::contains("gc"));
}

#[test]
fn check_without_a_trace_plans_the_build_command() {
  let build_dir = TempDir::new().unwrap();
  let work_dir = TempDir::new().unwrap();

  retrace(&build_dir, &work_dir)
    .arg("check")
    .assert()
    .success()
    .stdout(predicate::str::contains("never run"))
    .stdout(predicate::str::contains("1 command(s) would rerun"));
}

#[test]
fn check_supports_json_output() {
  let build_dir = TempDir::new().unwrap();
  let work_dir = TempDir::new().unwrap();

  retrace(&build_dir, &work_dir)
    .args(["check", "--format", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"would_rerun\""))
    .stdout(predicate::str::contains("never run"));
}

#[test]
fn build_dry_run_prints_without_executing() {
  let build_dir = TempDir::new().unwrap();
  let work_dir = TempDir::new().unwrap();
  std::fs::write(work_dir.path().join("Buildfile"), "touch built-marker\n").unwrap();

  retrace(&build_dir, &work_dir)
    .args(["build", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("would rerun"));

  assert!(!work_dir.path().join("built-marker").exists());
}

#[test]
fn build_runs_the_buildfile() {
  let build_dir = TempDir::new().unwrap();
  let work_dir = TempDir::new().unwrap();
  std::fs::write(work_dir.path().join("Buildfile"), "touch built-marker\n").unwrap();

  retrace(&build_dir, &work_dir).arg("build").assert().success();

  assert!(work_dir.path().join("built-marker").exists());
  assert!(build_dir.path().join("trace").exists());
}

#[test]
fn failing_buildfile_exits_nonzero() {
  let build_dir = TempDir::new().unwrap();
  let work_dir = TempDir::new().unwrap();
  std::fs::write(work_dir.path().join("Buildfile"), "exit 7\n").unwrap();

  retrace(&build_dir, &work_dir).arg("build").assert().code(1);
}

#[test]
fn gc_dry_run_reports_stats() {
  let build_dir = TempDir::new().unwrap();
  let work_dir = TempDir::new().unwrap();

  retrace(&build_dir, &work_dir)
    .args(["gc", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("files removed"));
}
