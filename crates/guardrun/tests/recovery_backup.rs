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

//! Recovery execution with backups: edits, rollback, gated repair commands
//! and configuration changes.

use guardrun::config::{GatePolicy, RecoveryConfig, SandboxConfig};
use guardrun::recovery::{
    file_checksum, ActionOperation, CommandTemplate, ConfigOp, RecoveryAction, Rollback,
};
use guardrun::sandbox::SoftLimiter;
use guardrun::{
    ActionKind, BackupStore, DetectedFault, ErrorClassifier, ExecutionContext, RecoveryExecutor,
    RecoveryPlanner, SandboxRuntime, SecurityGate, ViolationKind,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

struct Harness {
    executor: RecoveryExecutor,
    context: ExecutionContext,
}

fn harness(dir: &Path, extra_prefixes: &[&str]) -> Harness {
    let gate = SecurityGate::new(GatePolicy {
        project_root: Some(dir.to_path_buf()),
        repair_prefixes: extra_prefixes.iter().map(|p| (*p).to_string()).collect(),
        ..GatePolicy::default()
    })
    .unwrap();
    let runtime = SandboxRuntime::new(Arc::new(gate), SandboxConfig::default())
        .with_limiter(Box::new(SoftLimiter));
    let backups = BackupStore::new(Some(&dir.join(".backups"))).unwrap();
    let executor = RecoveryExecutor::new(
        Arc::new(runtime),
        Arc::new(backups),
        RecoveryConfig::default(),
    );
    let context = ExecutionContext::builder(dir).timeout_ms(10_000).build().unwrap();
    Harness { executor, context }
}

fn syntax_fault(path: &Path) -> DetectedFault {
    let text = format!("{}:1: SyntaxError: expected ':'", path.display());
    ErrorClassifier::default()
        .classify(&text, None)
        .into_iter()
        .next()
        .unwrap()
}

fn command_action(name: &str, template: &str, mutates_file: bool, criteria: &[&str]) -> RecoveryAction {
    RecoveryAction {
        name: name.to_string(),
        kind: ActionKind::Command,
        operation: ActionOperation::Command(CommandTemplate::parse(template).unwrap()),
        success_criteria: criteria.iter().map(|c| (*c).to_string()).collect(),
        confidence: 0.5,
        mutates_file,
        rollback: if mutates_file {
            Rollback::RestoreBackup
        } else {
            Rollback::None
        },
    }
}

#[test]
fn edit_then_rollback_restores_exact_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[]);
    let path = dir.path().join("greet.py");
    fs::write(&path, "def greet(name)\n    return name\n").unwrap();
    let before = file_checksum(&path).unwrap();

    let fault = syntax_fault(&path);
    let action = RecoveryPlanner::new()
        .plan("syntax_error")
        .into_iter()
        .find(|action| action.name == "insert_missing_colon")
        .unwrap();
    let attempt = h.executor.attempt(&action, &fault, &h.context).unwrap();
    let outcome = attempt.outcome;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "def greet(name):\n    return name\n"
    );
    let backup = outcome.backup.clone().unwrap();
    assert_eq!(backup.checksum, before);

    let undo = h.executor.rollback(&outcome, &h.context);
    assert!(undo.success, "{:?}", undo.error);
    assert!(undo.rollback_performed);
    assert_eq!(file_checksum(&path).unwrap(), before);
}

#[test]
fn failed_mutating_command_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["truncate"]);
    let path = dir.path().join("greet.py");
    fs::write(&path, "def greet(name)\n    return name\n").unwrap();
    let before = file_checksum(&path).unwrap();

    let action = command_action(
        "truncate_file",
        "truncate -s 0 {file_path}",
        true,
        &["this text is never printed"],
    );
    let outcome = h
        .executor
        .attempt(&action, &syntax_fault(&path), &h.context)
        .unwrap()
        .outcome;
    assert!(!outcome.success);
    assert_eq!(outcome.operation.as_deref(), Some("truncate -s 0 greet.py"));
    assert!(outcome.rollback_performed);
    assert_eq!(file_checksum(&path).unwrap(), before);
}

#[test]
fn repair_commands_outside_the_prefixes_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[]);
    let path = dir.path().join("greet.py");
    fs::write(&path, "x = 1\n").unwrap();

    let action = command_action("remove", "rm {file_path}", false, &[]);
    let outcome = h
        .executor
        .attempt(&action, &syntax_fault(&path), &h.context)
        .unwrap()
        .outcome;
    assert!(!outcome.success);
    assert_eq!(outcome.exit_code, None);
    assert_eq!(
        outcome.security_violations[0].kind,
        ViolationKind::RepairNotAllowed
    );
    assert!(path.exists());
}

#[test]
fn timeout_extension_adjusts_the_retry_context() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[]);
    let fault = ErrorClassifier::default()
        .classify("TimeoutError: timed out", None)
        .into_iter()
        .next()
        .unwrap();
    let action = RecoveryPlanner::new().plan("timeout").into_iter().next().unwrap();
    assert_eq!(action.operation, ActionOperation::Config(ConfigOp::ExtendTimeout { factor: 2 }));

    let attempt = h.executor.attempt(&action, &fault, &h.context).unwrap();
    assert!(attempt.outcome.success);
    let retry = attempt.retry_context.unwrap();
    assert_eq!(retry.timeout_ms(), 20_000);
    assert_eq!(h.context.timeout_ms(), 10_000);
}

#[test]
fn attempt_timeout_stays_below_the_outer_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[]);
    let outer = std::time::Duration::from_secs(8);
    assert_eq!(h.executor.attempt_timeout(outer).as_millis(), 6_000);
    let long = std::time::Duration::from_secs(3_600);
    assert_eq!(
        h.executor.attempt_timeout(long).as_millis(),
        u128::from(RecoveryConfig::default().attempt_timeout_ms)
    );
}

#[test]
fn backup_records_are_kept_in_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &[]);
    let path = dir.path().join("one.py");
    fs::write(&path, "if ready\n    go()\n").unwrap();
    let action = RecoveryPlanner::new()
        .plan("syntax_error")
        .into_iter()
        .next()
        .unwrap();
    h.executor
        .attempt(&action, &syntax_fault(&path), &h.context)
        .unwrap();
    let records = h.executor.backups().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_path, path);
    assert!(records[0].stored_path.starts_with(h.executor.backups().namespace()));
}
