// Test module - relaxed lint rules
#![allow(clippy::default_trait_access)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::inefficient_to_string)]
#![allow(clippy::panic)]
#![allow(clippy::manual_assert)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::cast_possible_truncation)]
#![allow(missing_docs)]

//! End-to-end runs of the `guardrun` binary: exit codes and JSON reports.

use guardrun::{FailureKind, SafetyReport, ViolationKind};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn guardrun_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_guardrun"));
    cmd.env("NO_COLOR", "1").env_remove("GUARDRUN_LOG");
    cmd
}

fn exec_json(dir: &Path, extra: &[&str], command: &[&str]) -> Output {
    guardrun_bin()
        .arg("exec")
        .arg("--json")
        .arg("--cwd")
        .arg(dir)
        .args(extra)
        .arg("--")
        .args(command)
        .output()
        .expect("failed to execute guardrun")
}

fn parse_report(output: &Output) -> SafetyReport {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|err| {
        panic!(
            "stdout is not a report ({err}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn successful_command_exits_zero_with_report() {
    let dir = tempfile::tempdir().unwrap();
    let output = exec_json(dir.path(), &[], &["echo", "hello guardrun"]);

    assert_eq!(output.status.code(), Some(0));
    let report = parse_report(&output);
    assert!(report.success);
    assert_eq!(report.failure, None);
    let result = report.initial_result.unwrap();
    assert_eq!(result.stdout, "hello guardrun\n");
}

#[test]
fn refused_command_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let output = exec_json(dir.path(), &[], &["rm -rf /"]);

    assert_eq!(output.status.code(), Some(2));
    let report = parse_report(&output);
    assert_eq!(report.failure, Some(FailureKind::SecurityViolation));
    assert!(!report.security_violations().is_empty());
}

#[test]
fn cwd_outside_the_project_is_refused() {
    let project = tempfile::tempdir().unwrap();
    let output = guardrun_bin()
        .current_dir(project.path())
        .args(["exec", "--json", "--cwd", "/etc", "--", "ls"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let report = parse_report(&output);
    assert_eq!(report.failure, Some(FailureKind::SecurityViolation));
    assert!(report
        .security_violations()
        .iter()
        .any(|v| v.kind == ViolationKind::WorkingDirectory));
    assert!(report.initial_result.unwrap().stdout.is_empty());
}

#[test]
fn timeout_exits_124() {
    let dir = tempfile::tempdir().unwrap();
    let output = exec_json(
        dir.path(),
        &["--timeout-ms", "500", "--no-recover"],
        &["sleep", "5"],
    );

    assert_eq!(output.status.code(), Some(124));
    let report = parse_report(&output);
    assert_eq!(report.failure, Some(FailureKind::Timeout));
}

#[test]
fn failing_command_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let output = exec_json(dir.path(), &["--no-recover"], &["exit 3"]);

    assert_eq!(output.status.code(), Some(1));
    let report = parse_report(&output);
    assert_eq!(report.failure, Some(FailureKind::ProcessFailure));
    assert_eq!(report.initial_result.unwrap().exit_code, 3);
}

#[test]
fn human_output_passes_streams_through() {
    let dir = tempfile::tempdir().unwrap();
    let output = guardrun_bin()
        .arg("exec")
        .arg("--cwd")
        .arg(dir.path())
        .arg("--")
        .arg("echo out; echo err >&2")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("err"));
    assert!(stderr.contains("succeeded"), "{stderr}");
}

#[test]
fn env_flag_reaches_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let output = exec_json(dir.path(), &["--env", "GREETING=hi"], &["echo $GREETING"]);

    let report = parse_report(&output);
    assert_eq!(report.initial_result.unwrap().stdout, "hi\n");
}

#[test]
fn malformed_config_exits_three() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("guardrun.json");
    fs::write(&config, "{ not json").unwrap();

    let output = guardrun_bin()
        .arg("--config")
        .arg(&config)
        .arg("exec")
        .arg("--json")
        .arg("--cwd")
        .arg(dir.path())
        .arg("--")
        .arg("true")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(3));
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["code"], "E_CONFIG");
}

#[test]
fn yaml_config_adds_denied_program() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("guardrun.yaml");
    fs::write(&config, "gate:\n  denied_programs:\n    - curl\n").unwrap();

    let output = guardrun_bin()
        .arg("--config")
        .arg(&config)
        .arg("exec")
        .arg("--json")
        .arg("--cwd")
        .arg(dir.path())
        .arg("--")
        .arg("curl https://example.com")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let output = guardrun_bin()
        .arg("exec")
        .arg("--no-such-flag")
        .arg("--")
        .arg("true")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn code_reads_source_from_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = guardrun_bin()
        .arg("code")
        .arg("--json")
        .arg("--cwd")
        .arg(dir.path())
        .arg("--interpreter")
        .arg("shell")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"echo from stdin\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    let report = parse_report(&output);
    assert_eq!(report.initial_result.unwrap().stdout, "from stdin\n");
}

#[test]
fn write_rolls_back_invalid_python() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("app.py");
    fs::write(&target, "x = 1\n").unwrap();
    let content = dir.path().join("new.txt");
    fs::write(&content, "y = 2)\n").unwrap();

    let output = guardrun_bin()
        .arg("write")
        .arg("--json")
        .arg("--cwd")
        .arg(dir.path())
        .arg("--content")
        .arg(&content)
        .arg("app.py")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let report = parse_report(&output);
    assert_eq!(report.failure, Some(FailureKind::ValidationFailure));
    assert_eq!(fs::read_to_string(&target).unwrap(), "x = 1\n");
}
