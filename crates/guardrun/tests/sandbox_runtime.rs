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
#![cfg(unix)]

//! Sandboxed execution: gating, timeouts with process-group kill, output
//! ceilings, write-back and OS resource limits.

use guardrun::config::{GatePolicy, ResourceLimits, SandboxConfig};
use guardrun::sandbox::{RlimitLimiter, SoftLimiter};
use guardrun::{
    ExecutionContext, ExecutionStatus, ResourceKind, SandboxRuntime, SecurityGate,
    TIMEOUT_EXIT_CODE,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn runtime(root: &Path) -> SandboxRuntime {
    let gate = SecurityGate::new(GatePolicy {
        project_root: Some(root.to_path_buf()),
        ..GatePolicy::default()
    })
    .unwrap();
    let config = SandboxConfig {
        limits: ResourceLimits::unlimited(),
        enforce_limits: false,
        ..SandboxConfig::default()
    };
    SandboxRuntime::new(Arc::new(gate), config).with_limiter(Box::new(SoftLimiter))
}

fn context(dir: &Path, timeout_ms: u64) -> ExecutionContext {
    ExecutionContext::builder(dir)
        .timeout_ms(timeout_ms)
        .build()
        .unwrap()
}

/// Alive and not a zombie.
fn process_alive(pid: i32) -> bool {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"));
    match stat {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok(),
    }
}

#[test]
fn successful_command_captures_streams() {
    let dir = tempfile::tempdir().unwrap();
    let result = runtime(dir.path()).run("echo out; echo err >&2", &context(dir.path(), 5_000));
    assert!(result.success);
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert!(result.workspace_dir.is_some());
}

#[test]
fn exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let result = runtime(dir.path()).run("exit 7", &context(dir.path(), 5_000));
    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.exit_code, 7);
}

#[test]
fn rejected_command_never_runs() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker.txt");
    let command = format!("touch {} && sudo true", marker.display());
    let result = runtime(dir.path()).run(&command, &context(dir.path(), 5_000));
    assert_eq!(result.status, ExecutionStatus::Rejected);
    assert!(!result.security_violations.is_empty());
    assert_eq!(result.duration_ms, 0);
    assert!(!marker.exists());
}

#[test]
fn timeout_kills_the_whole_process_tree() {
    let dir = tempfile::tempdir().unwrap();
    let pid_dir = tempfile::tempdir().unwrap();
    let pid_file = pid_dir.path().join("child.pid");
    let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let started = Instant::now();
    let result = runtime(dir.path()).run(&command, &context(dir.path(), 1_000));
    let elapsed = started.elapsed();

    assert!(result.timed_out);
    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    let pid: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while process_alive(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!process_alive(pid), "background child {pid} survived");
}

#[test]
fn output_is_truncated_at_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::builder(dir.path())
        .max_output_bytes(1_000)
        .build()
        .unwrap();
    let result = runtime(dir.path()).run("head -c 200000 /dev/zero | tr '\\0' x", &ctx);
    assert!(result.success, "{:?}", result.error);
    assert!(result.stdout_truncated);
    assert!(result.stdout.starts_with(&"x".repeat(1_000)));
    assert!(result.stdout.contains("output truncated after 1000 bytes"));
}

#[test]
fn workspace_is_a_copy_unless_write_back() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    fs::write(&file, "original\n").unwrap();
    let runtime = runtime(dir.path());

    let result = runtime.run("echo changed > notes.txt", &context(dir.path(), 5_000));
    assert!(result.success);
    assert_eq!(fs::read_to_string(&file).unwrap(), "original\n");

    let ctx = context(dir.path(), 5_000).with_write_back(true);
    let result = runtime.run("echo changed > notes.txt", &ctx);
    assert!(result.success);
    assert_eq!(fs::read_to_string(&file).unwrap(), "changed\n");
    assert_eq!(result.modified_files.len(), 1);
}

#[test]
fn environment_is_minimal() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::builder(dir.path())
        .env("APP_MODE", "test")
        .build()
        .unwrap();
    let result = runtime(dir.path()).run("echo \"$APP_MODE:$HOME\"", &ctx);
    assert!(result.success);
    let line = result.stdout.trim();
    assert!(line.starts_with("test:"), "{line}");
    assert!(line.ends_with(".guardrun/home"), "{line}");
}

#[cfg(target_os = "linux")]
#[test]
fn cpu_limit_is_enforced_by_the_os() {
    let dir = tempfile::tempdir().unwrap();
    let gate = SecurityGate::new(GatePolicy {
        project_root: Some(dir.path().to_path_buf()),
        ..GatePolicy::default()
    })
    .unwrap();
    let config = SandboxConfig {
        limits: ResourceLimits {
            memory_bytes: None,
            cpu_time_secs: Some(1),
            file_size_bytes: None,
        },
        ..SandboxConfig::default()
    };
    let runtime = SandboxRuntime::new(Arc::new(gate), config).with_limiter(Box::new(RlimitLimiter));
    let result = runtime.run("while :; do :; done", &context(dir.path(), 20_000));
    assert!(!result.timed_out);
    assert_eq!(result.status, ExecutionStatus::ResourceViolation);
    assert!(result
        .resource_violations
        .iter()
        .any(|violation| violation.resource == ResourceKind::CpuTime));
}
