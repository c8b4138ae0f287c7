//! File-mutation flow: write, validate, repair with file edits, and restore
//! the original when the file stays invalid.

use super::{fail_internal, is_file_edit, RecoverySettings, SafetyOrchestrator};
use crate::classifier::ClassifyOptions;
use crate::error::GuardError;
use crate::model::{BackupRecord, ExecutionContext, ExecutionResult, FailureKind, SafetyReport, ValidationReport};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Validate, repair, re-validate cycles before giving up.
const MAX_REPAIR_ROUNDS: usize = 5;

impl SafetyOrchestrator {
    pub(super) fn mutate_file(
        &self,
        mut report: SafetyReport,
        path: &Path,
        new_content: &str,
        context: &ExecutionContext,
        settings: RecoverySettings,
    ) -> SafetyReport {
        let target = resolve_target(path, context);
        if let Some(violations) = self.refuse_target(&target) {
            tracing::warn!(path = %target.display(), "file mutation refused by security gate");
            report.failure = Some(FailureKind::SecurityViolation);
            report.initial_failure = report.failure;
            report.initial_result = Some(ExecutionResult::rejected(
                format!("write {}", target.display()),
                violations,
            ));
            return report;
        }

        let backup = if target.exists() {
            let before = self.validator.validate(&target);
            tracing::debug!(valid = before.is_valid, "validated file before mutation");
            match self.validator.backup(&target) {
                Ok(record) => Some(record),
                Err(err) => {
                    fail_internal(&mut report, &err);
                    return report;
                }
            }
        } else {
            None
        };

        if let Err(err) = fs::write(&target, new_content) {
            fail_internal(&mut report, &GuardError::io("failed to write file", err));
            self.restore_original(&mut report, &target, backup.as_ref());
            return report;
        }

        let mut validation = self.validator.validate(&target);
        if !validation.is_valid {
            report.initial_failure = Some(FailureKind::ValidationFailure);
            if settings.auto_recover {
                validation = self.repair_file(&mut report, &target, context, settings, validation);
            }
        }

        if validation.is_valid && report.error.is_none() {
            report.success = true;
            report.failure = None;
        } else {
            tracing::warn!(
                path = %target.display(),
                issues = validation.issues.len(),
                "file still invalid, restoring original"
            );
            if report.error.is_none() {
                report.failure = Some(FailureKind::ValidationFailure);
            }
            self.restore_original(&mut report, &target, backup.as_ref());
        }
        report.validation = Some(validation);
        report
    }

    fn refuse_target(&self, target: &Path) -> Option<Vec<crate::model::SecurityViolation>> {
        let parent = target.parent().filter(|dir| !dir.as_os_str().is_empty())?;
        let violations = self.gate.check_working_directory(parent);
        (!violations.is_empty()).then_some(violations)
    }

    /// Classify the validation issues and apply file edits until the file
    /// validates or no untried fault remains.
    fn repair_file(
        &self,
        report: &mut SafetyReport,
        target: &Path,
        context: &ExecutionContext,
        settings: RecoverySettings,
        mut validation: ValidationReport,
    ) -> ValidationReport {
        let options = ClassifyOptions {
            file_path: Some(target.to_path_buf()),
            base_dir: Some(context.working_directory().to_path_buf()),
            workspace_dir: None,
        };
        let mut tried = BTreeSet::new();
        for round in 1..=MAX_REPAIR_ROUNDS {
            let fresh: Vec<_> = self
                .classifier
                .classify_with(&validation.diagnostic_text(), &options)
                .into_iter()
                .filter(|fault| tried.insert(fault.repair_key()))
                .collect();
            if fresh.is_empty() {
                break;
            }
            report.faults.extend(fresh.iter().cloned());

            let outcome = self.recover(&fresh, context, settings.max_attempts, is_file_edit);
            report.recovery_outcomes.extend(outcome.outcomes);
            if let Some(err) = outcome.error {
                fail_internal(report, &err);
                break;
            }
            if outcome.repaired.is_none() {
                break;
            }
            report.retried = true;
            validation = self.validator.validate(target);
            tracing::debug!(round, valid = validation.is_valid, "re-validated after repair");
            if validation.is_valid {
                break;
            }
        }
        validation
    }

    /// Put the file back as it was before the mutation: restore the
    /// snapshot, or remove a file the mutation created.
    fn restore_original(&self, report: &mut SafetyReport, target: &Path, backup: Option<&BackupRecord>) {
        let restored = match backup {
            Some(record) => self.backups.restore(record),
            None => match fs::remove_file(target) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(GuardError::io("failed to remove invalid new file", err)),
            },
        };
        if let Err(err) = restored {
            fail_internal(report, &err);
        }
    }
}

/// Relative paths resolve against the context's working directory.
fn resolve_target(path: &Path, context: &ExecutionContext) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        context.working_directory().join(path)
    }
}
