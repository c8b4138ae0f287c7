use crate::error::ErrorInfo;
use crate::model::{DetectedFault, ExecutionResult, RecoveryOutcome, RunId, SecurityViolation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current report format version.
pub const REPORT_VERSION: u32 = 1;

/// Which orchestrator entry point produced a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Command,
    FileMutation,
    Code,
}

/// Failure taxonomy. Absent on a successful report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Refused before anything ran.
    SecurityViolation,
    /// Non-zero exit.
    ProcessFailure,
    /// Killed at the wall-clock deadline.
    Timeout,
    /// Post-hoc or OS-enforced limit breach.
    ResourceViolation,
    /// Failed, and no rule matched the output.
    ClassificationMiss,
    /// Faults were found but every candidate repair failed.
    RecoveryFailure,
    /// A file mutation left the file invalid.
    ValidationFailure,
    /// Unexpected harness error; the report is best-effort.
    Internal,
}

/// Outcome of validating one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Issues joined as diagnostic text for the classifier.
    #[must_use]
    pub fn diagnostic_text(&self) -> String {
        self.issues.join("\n")
    }
}

/// Aggregate result of one orchestrator invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    pub report_version: u32,
    pub run_id: RunId,
    pub flow: Flow,
    /// Command, file path, or interpreter invocation that was requested.
    pub subject: String,
    pub success: bool,
    pub failure: Option<FailureKind>,
    /// How the first execution or validation failed, before any recovery.
    pub initial_failure: Option<FailureKind>,
    pub faults: Vec<DetectedFault>,
    pub recovery_outcomes: Vec<RecoveryOutcome>,
    pub initial_result: Option<ExecutionResult>,
    pub final_result: Option<ExecutionResult>,
    pub validation: Option<ValidationReport>,
    pub retried: bool,
    pub recommendations: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<ErrorInfo>,
}

impl SafetyReport {
    /// Empty, unsuccessful report for one invocation.
    #[must_use]
    pub(crate) fn new(run_id: RunId, flow: Flow, subject: impl Into<String>) -> Self {
        Self {
            report_version: REPORT_VERSION,
            run_id,
            flow,
            subject: subject.into(),
            success: false,
            failure: None,
            initial_failure: None,
            faults: Vec::new(),
            recovery_outcomes: Vec::new(),
            initial_result: None,
            final_result: None,
            validation: None,
            retried: false,
            recommendations: Vec::new(),
            duration_ms: 0,
            error: None,
        }
    }

    /// Gate violations from whichever execution recorded them.
    #[must_use]
    pub fn security_violations(&self) -> &[SecurityViolation] {
        self.initial_result
            .as_ref()
            .map(|result| result.security_violations.as_slice())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_security_violation(&self) -> bool {
        matches!(self.failure, Some(FailureKind::SecurityViolation))
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    #[must_use]
    pub fn recovery_attempts(&self) -> usize {
        self.recovery_outcomes.len()
    }
}
