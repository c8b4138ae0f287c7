//! End-to-end protected execution.
//!
//! Every entry point follows the same skeleton: execute (or validate),
//! classify the failure, try candidate repairs, retry once after the first
//! repair that succeeds, and assemble a [`SafetyReport`]. Entry points never
//! return errors; harness failures become `FailureKind::Internal` reports.

mod mutation;

use crate::classifier::{fault_recommendations, ClassifyOptions, ErrorClassifier, ExecutionSummary};
use crate::config::{validate_config, GuardConfig};
use crate::error::{GuardError, GuardResult};
use crate::gate::SecurityGate;
use crate::model::execution::duration_to_ms;
use crate::model::{
    ActionKind, DetectedFault, ExecutionContext, ExecutionResult, ExecutionStatus, FailureKind,
    Flow, RecoveryOutcome, ResourceKind, RunId, SafetyReport,
};
use crate::recovery::{BackupStore, RecoveryAction, RecoveryExecutor, RecoveryPlanner};
use crate::sandbox::{CodeRunner, Interpreter, SandboxRuntime};
use crate::validate::{FileValidator, StructuralValidator};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Recommendation attached to every gate refusal.
const POLICY_RECOMMENDATION: &str =
    "command was refused by the security gate: review it against the policy";

/// Fallback when a failure produced nothing more specific.
const INSPECT_RECOMMENDATION: &str = "inspect the captured output and the detected faults";

/// Composes the gate, sandbox, classifier, planner, executor and validator.
#[derive(Debug, Clone)]
pub struct SafetyOrchestrator {
    gate: Arc<SecurityGate>,
    runtime: Arc<SandboxRuntime>,
    classifier: Arc<ErrorClassifier>,
    planner: RecoveryPlanner,
    executor: RecoveryExecutor,
    backups: Arc<BackupStore>,
    validator: Arc<dyn FileValidator>,
}

/// Per-invocation recovery knobs.
#[derive(Clone, Copy, Debug)]
struct RecoverySettings {
    max_attempts: usize,
    auto_recover: bool,
}

/// What one pass over the detected faults produced.
#[derive(Debug, Default)]
struct RecoveryRound {
    outcomes: Vec<RecoveryOutcome>,
    /// Set once an action succeeded; holds the adjusted context, if any.
    repaired: Option<Option<ExecutionContext>>,
    error: Option<GuardError>,
}

impl SafetyOrchestrator {
    /// Build every component from one configuration.
    ///
    /// # Errors
    /// `E_CONFIG` or `E_TEMPLATE` for invalid configuration, `E_IO` if the
    /// backup namespace cannot be created.
    pub fn from_config(config: &GuardConfig) -> GuardResult<Self> {
        validate_config(config)?;
        let gate = Arc::new(SecurityGate::new(config.gate.clone())?);
        let runtime = Arc::new(SandboxRuntime::new(Arc::clone(&gate), config.sandbox.clone()));
        let backups = Arc::new(BackupStore::new(config.recovery.backup_dir.as_deref())?);
        let planner = RecoveryPlanner::with_extra_actions(&config.recovery.extra_actions)?;
        let executor = RecoveryExecutor::new(
            Arc::clone(&runtime),
            Arc::clone(&backups),
            config.recovery.clone(),
        );
        let validator: Arc<dyn FileValidator> =
            Arc::new(StructuralValidator::new(Arc::clone(&backups)));
        Ok(Self {
            gate,
            runtime,
            classifier: Arc::new(ErrorClassifier::new(config.ledger.clone())),
            planner,
            executor,
            backups,
            validator,
        })
    }

    /// Replace the file validator used by [`Self::run_file_mutation`].
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn FileValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Share a classifier, and with it a ledger, across orchestrators.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<SandboxRuntime> {
        &self.runtime
    }

    #[must_use]
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    #[must_use]
    pub fn planner(&self) -> &RecoveryPlanner {
        &self.planner
    }

    #[must_use]
    pub fn executor(&self) -> &RecoveryExecutor {
        &self.executor
    }

    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Run `command` under protection, repairing and retrying once when
    /// `auto_recover` is set.
    #[tracing::instrument(skip(self, context), fields(flow = "command"))]
    pub fn run(
        &self,
        command: &str,
        context: &ExecutionContext,
        max_recovery_attempts: usize,
        auto_recover: bool,
    ) -> SafetyReport {
        let started = Instant::now();
        let report = SafetyReport::new(RunId::new(), Flow::Command, command);
        let settings = RecoverySettings {
            max_attempts: max_recovery_attempts,
            auto_recover,
        };
        let report = self.execute_flow(report, context, settings, None, &|ctx| {
            self.runtime.run(command, ctx)
        });
        self.finish(report, started)
    }

    /// Run inline `source` with `interpreter`. Repairs edit the scratch
    /// source file, which the retry runs again.
    #[tracing::instrument(skip(self, source, context), fields(flow = "code"))]
    pub fn run_code(
        &self,
        source: &str,
        interpreter: Interpreter,
        context: &ExecutionContext,
        max_recovery_attempts: usize,
        auto_recover: bool,
    ) -> SafetyReport {
        let started = Instant::now();
        let runner = CodeRunner::new(Arc::clone(&self.runtime), interpreter);
        let mut report = SafetyReport::new(
            RunId::new(),
            Flow::Code,
            format!("{} <inline>", interpreter.program()),
        );
        let prepared = match runner.prepare(source) {
            Ok(prepared) => prepared,
            Err(err) => {
                fail_internal(&mut report, &err);
                return self.finish(report, started);
            }
        };
        report.subject = prepared.command();
        let settings = RecoverySettings {
            max_attempts: max_recovery_attempts,
            auto_recover,
        };
        let report = self.execute_flow(report, context, settings, Some(prepared.path()), &|ctx| {
            runner.run_prepared(&prepared, ctx)
        });
        self.finish(report, started)
    }

    /// Write `new_content` to `path`, keeping the file valid: failing
    /// validation is repaired with file edits, and the original is restored
    /// if the file stays invalid.
    #[tracing::instrument(skip(self, new_content, context), fields(flow = "file_mutation"))]
    pub fn run_file_mutation(
        &self,
        path: &Path,
        new_content: &str,
        context: &ExecutionContext,
        max_recovery_attempts: usize,
        auto_recover: bool,
    ) -> SafetyReport {
        let started = Instant::now();
        let report = SafetyReport::new(RunId::new(), Flow::FileMutation, path.display().to_string());
        let settings = RecoverySettings {
            max_attempts: max_recovery_attempts,
            auto_recover,
        };
        let report = self.mutate_file(report, path, new_content, context, settings);
        self.finish(report, started)
    }

    /// Shared execute, classify, recover and retry skeleton.
    fn execute_flow(
        &self,
        mut report: SafetyReport,
        context: &ExecutionContext,
        settings: RecoverySettings,
        default_file: Option<&Path>,
        execute: &dyn Fn(&ExecutionContext) -> ExecutionResult,
    ) -> SafetyReport {
        let initial = execute(context);
        report.initial_failure = failure_kind(&initial);

        match initial.status {
            ExecutionStatus::Succeeded => {
                self.record(report.run_id, &initial, 0);
                report.success = true;
                report.initial_result = Some(initial);
                return report;
            }
            ExecutionStatus::Rejected => {
                tracing::warn!(violations = initial.security_violations.len(), "refused by security gate");
                self.record(report.run_id, &initial, 0);
                report.failure = Some(FailureKind::SecurityViolation);
                report.initial_result = Some(initial);
                return report;
            }
            ExecutionStatus::SpawnFailed => {
                self.record(report.run_id, &initial, 0);
                let err = GuardError::spawn(
                    "process could not be started",
                    initial.error.as_deref().unwrap_or("unknown error"),
                );
                report.initial_result = Some(initial);
                fail_internal(&mut report, &err);
                return report;
            }
            ExecutionStatus::Failed | ExecutionStatus::TimedOut | ExecutionStatus::ResourceViolation => {}
        }

        let faults = self.detect_faults(&initial, context, default_file);
        self.record(report.run_id, &initial, faults.len());
        tracing::info!(
            status = ?initial.status,
            faults = faults.len(),
            "execution failed"
        );
        report.failure = report.initial_failure;
        report.initial_result = Some(initial);
        report.faults = faults;
        if !settings.auto_recover {
            return report;
        }
        if report.faults.is_empty() {
            report.failure = Some(FailureKind::ClassificationMiss);
            return report;
        }

        let round = self.recover(&report.faults, context, settings.max_attempts, |_| true);
        report.recovery_outcomes = round.outcomes;
        if let Some(err) = round.error {
            fail_internal(&mut report, &err);
            return report;
        }
        let Some(adjusted) = round.repaired else {
            report.failure = Some(FailureKind::RecoveryFailure);
            return report;
        };

        let retry_context = adjusted.unwrap_or_else(|| context.clone());
        tracing::info!("repair succeeded, retrying once");
        let retried = execute(&retry_context);
        let retry_faults = if retried.success {
            0
        } else {
            self.detect_faults(&retried, &retry_context, default_file).len()
        };
        self.record(report.run_id, &retried, retry_faults);
        report.retried = true;
        report.success = retried.success;
        report.failure = failure_kind(&retried);
        report.final_result = Some(retried);
        report
    }

    /// Classified faults from the output, plus synthesized faults for
    /// conditions the harness observed directly.
    fn detect_faults(
        &self,
        result: &ExecutionResult,
        context: &ExecutionContext,
        default_file: Option<&Path>,
    ) -> Vec<DetectedFault> {
        let options = ClassifyOptions {
            file_path: default_file.map(Path::to_path_buf),
            base_dir: Some(context.working_directory().to_path_buf()),
            workspace_dir: result.workspace_dir.clone(),
        };
        let mut faults = self
            .classifier
            .classify_with(&result.combined_output(), &options);

        let mut observed: Vec<(&str, String)> = Vec::new();
        if result.timed_out {
            observed.push((
                "timeout",
                format!("killed after the {}ms deadline", context.timeout_ms()),
            ));
        }
        for violation in &result.resource_violations {
            let fault_type = match violation.resource {
                ResourceKind::Memory => "memory_error",
                ResourceKind::CpuTime | ResourceKind::FileSize => "resource_limit",
            };
            observed.push((fault_type, violation.message.clone()));
        }
        for (fault_type, message) in observed {
            if faults.iter().any(|fault| fault.fault_type == fault_type) {
                continue;
            }
            let synthetic = ClassifyOptions {
                file_path: None,
                ..options.clone()
            };
            if let Some(fault) = self.classifier.synthesize(fault_type, message, &synthetic) {
                faults.push(fault);
            }
        }
        faults
    }

    /// Try candidate actions for each distinct fault until one succeeds.
    fn recover(
        &self,
        faults: &[DetectedFault],
        context: &ExecutionContext,
        max_attempts: usize,
        accept: impl Fn(&RecoveryAction) -> bool,
    ) -> RecoveryRound {
        let mut round = RecoveryRound::default();
        let mut seen = BTreeSet::new();
        for fault in faults {
            if !seen.insert(fault.repair_key()) {
                continue;
            }
            let actions = self.planner.plan(&fault.fault_type);
            if actions.is_empty() {
                tracing::debug!(fault_type = %fault.fault_type, "no recovery strategy");
            }
            for action in actions.iter().filter(|action| accept(action)).take(max_attempts) {
                match self.executor.attempt(action, fault, context) {
                    Ok(attempt) => {
                        let success = attempt.outcome.success;
                        round.outcomes.push(attempt.outcome);
                        if success {
                            round.repaired = Some(attempt.retry_context);
                            return round;
                        }
                    }
                    Err(err) => {
                        tracing::error!(action = %action.name, %err, "recovery harness failed");
                        round.error = Some(err);
                        return round;
                    }
                }
            }
        }
        round
    }

    fn record(&self, run_id: RunId, result: &ExecutionResult, fault_count: usize) {
        self.classifier
            .record_execution(ExecutionSummary::from_result(Some(run_id), result, fault_count));
    }

    /// Recommendations and timing, then the closing log line.
    fn finish(&self, mut report: SafetyReport, started: Instant) -> SafetyReport {
        report.recommendations = self.recommendations(&report);
        report.duration_ms = duration_to_ms(started.elapsed());
        tracing::info!(
            run_id = %report.run_id,
            success = report.success,
            failure = ?report.failure,
            faults = report.faults.len(),
            attempts = report.recovery_outcomes.len(),
            duration_ms = report.duration_ms,
            "protected run finished"
        );
        report
    }

    fn recommendations(&self, report: &SafetyReport) -> Vec<String> {
        let mut recommendations = self.classifier.recommendations();
        recommendations.extend(fault_recommendations(&report.faults));
        if report.is_security_violation()
            || report
                .recovery_outcomes
                .iter()
                .any(|outcome| !outcome.security_violations.is_empty())
        {
            recommendations.push(POLICY_RECOMMENDATION.to_string());
        }
        match report.failure {
            Some(FailureKind::ClassificationMiss) => recommendations
                .push("no known fault pattern matched the output: inspect it manually".to_string()),
            Some(FailureKind::RecoveryFailure) if report.recovery_outcomes.is_empty() => {
                recommendations.push("no recovery strategy is known for the detected faults".to_string());
            }
            _ => {}
        }
        if !report.success && recommendations.is_empty() {
            recommendations.push(INSPECT_RECOMMENDATION.to_string());
        }
        let mut seen = BTreeSet::new();
        recommendations.retain(|item| seen.insert(item.clone()));
        recommendations
    }
}

/// Failure kind of one execution, `None` when it succeeded.
fn failure_kind(result: &ExecutionResult) -> Option<FailureKind> {
    match result.status {
        ExecutionStatus::Succeeded => None,
        ExecutionStatus::Failed => Some(FailureKind::ProcessFailure),
        ExecutionStatus::TimedOut => Some(FailureKind::Timeout),
        ExecutionStatus::ResourceViolation => Some(FailureKind::ResourceViolation),
        ExecutionStatus::Rejected => Some(FailureKind::SecurityViolation),
        ExecutionStatus::SpawnFailed => Some(FailureKind::Internal),
    }
}

fn fail_internal(report: &mut SafetyReport, err: &GuardError) {
    tracing::error!(%err, "protected run aborted");
    report.success = false;
    report.failure = Some(FailureKind::Internal);
    report.error = Some(err.to_error_info());
}

fn is_file_edit(action: &RecoveryAction) -> bool {
    action.kind == ActionKind::FileEdit
}
