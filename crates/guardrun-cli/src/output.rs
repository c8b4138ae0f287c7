//! Report rendering and exit-code mapping.

use guardrun::gate::GateExplanation;
use guardrun::{
    DetectedFault, FailureKind, GuardError, GuardResult, SafetyReport, TIMEOUT_EXIT_CODE,
};
use serde::Serialize;

/// Exit code for a finished report.
///
/// A timeout that recovery could not fix still exits with the timeout code.
pub(crate) fn report_exit_code(report: &SafetyReport) -> i32 {
    if report.success {
        return 0;
    }
    match (report.failure, report.initial_failure) {
        (Some(FailureKind::SecurityViolation), _) => 2,
        (Some(FailureKind::Timeout), _)
        | (
            Some(FailureKind::ClassificationMiss | FailureKind::RecoveryFailure),
            Some(FailureKind::Timeout),
        ) => TIMEOUT_EXIT_CODE,
        _ => 1,
    }
}

pub(crate) fn failure_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::SecurityViolation => "security violation",
        FailureKind::ProcessFailure => "process failure",
        FailureKind::Timeout => "timeout",
        FailureKind::ResourceViolation => "resource violation",
        FailureKind::ClassificationMiss => "unclassified failure",
        FailureKind::RecoveryFailure => "recovery failed",
        FailureKind::ValidationFailure => "validation failure",
        FailureKind::Internal => "internal error",
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> GuardResult<()> {
    let payload = serde_json::to_string(value)
        .map_err(|err| GuardError::internal(format!("failed to serialize output: {err}")))?;
    println!("{payload}");
    Ok(())
}

pub(crate) fn emit_report(json: bool, report: &SafetyReport) -> GuardResult<i32> {
    if json {
        print_json(report)?;
    } else {
        print_report(report);
    }
    Ok(report_exit_code(report))
}

/// Pass the child's streams through, then summarize on stderr.
fn print_report(report: &SafetyReport) {
    if let Some(result) = report.final_result.as_ref().or(report.initial_result.as_ref()) {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
    }
    match report.failure {
        None => eprintln!("guardrun: `{}` succeeded ({}ms)", report.subject, report.duration_ms),
        Some(kind) => eprintln!(
            "guardrun: `{}` failed: {} ({}ms)",
            report.subject,
            failure_label(kind),
            report.duration_ms
        ),
    }
    for violation in report.security_violations() {
        eprintln!("  refused: {} ({})", violation.message, violation.subject);
    }
    if let Some(validation) = report.validation.as_ref() {
        for issue in &validation.issues {
            eprintln!("  invalid: {issue}");
        }
    }
    for fault in &report.faults {
        eprintln!("  fault: {}", fault_line(fault));
    }
    for outcome in &report.recovery_outcomes {
        let status = if outcome.success { "ok" } else { "failed" };
        let operation = outcome.operation.as_deref().unwrap_or("-");
        eprintln!("  repair {status}: {} `{operation}`", outcome.action_name);
        if outcome.rollback_performed {
            eprintln!("    rolled back");
        }
    }
    if report.retried {
        eprintln!("  retried after repair");
    }
    for recommendation in &report.recommendations {
        eprintln!("  hint: {recommendation}");
    }
    if let Some(error) = report.error.as_ref() {
        eprintln!("  error: {}: {}", error.code, error.message);
    }
}

fn fault_line(fault: &DetectedFault) -> String {
    let location = match (&fault.file_path, fault.line_number) {
        (Some(path), Some(line)) => format!(" at {}:{line}", path.display()),
        (Some(path), None) => format!(" in {}", path.display()),
        _ => String::new(),
    };
    format!(
        "{} [{:?}, {:.2}]{location}: {}",
        fault.fault_type, fault.severity, fault.confidence, fault.message
    )
}

pub(crate) fn emit_faults(json: bool, faults: &[DetectedFault]) -> GuardResult<()> {
    if json {
        return print_json(faults);
    }
    if faults.is_empty() {
        println!("no faults detected");
    }
    for fault in faults {
        println!("{}", fault_line(fault));
        for fix in &fault.suggested_fixes {
            println!("  fix: {fix}");
        }
    }
    Ok(())
}

pub(crate) fn emit_explanation(json: bool, explanation: &GateExplanation) -> GuardResult<()> {
    if json {
        return print_json(explanation);
    }
    if explanation.allowed {
        println!("policy: allowed");
    } else {
        println!("policy: denied");
        for violation in &explanation.violations {
            println!(" - {:?}: {}", violation.kind, violation.message);
        }
    }
    Ok(())
}

/// Print an error that ended the command and return its exit code.
pub(crate) fn emit_error(json: bool, err: GuardError) -> i32 {
    let code = err.code.exit_code();
    if json {
        if print_json(&err.to_error_info()).is_err() {
            eprintln!("error: {err}");
        }
    } else {
        eprintln!("{:?}", miette::Report::new(err));
    }
    code
}
