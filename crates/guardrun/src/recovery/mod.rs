//! Fault-driven repair with backup and rollback.
//!
//! [`RecoveryPlanner::plan`] maps a fault type to ordered candidate
//! [`RecoveryAction`]s. [`RecoveryExecutor::attempt`] runs one of them:
//! backup first when the action touches a file, then the edit, the
//! configuration change, or a gated repair command through the sandbox. A
//! failed mutating action is restored from its backup before the outcome is
//! returned.

mod backup;
mod edit;
mod strategies;
mod template;

pub use backup::{checksum, file_checksum, BackupStore};
pub use edit::{ConfigOp, EditOp};
pub(crate) use edit::is_block_header;
pub use template::{CommandTemplate, Slot, SlotBindings};

use crate::config::{ExtraAction, RecoveryConfig};
use crate::error::{ErrorCode, GuardError, GuardResult};
use crate::model::execution::duration_to_ms;
use crate::model::{
    ActionKind, BackupRecord, DetectedFault, ExecutionContext, RecoveryOutcome,
};
use crate::sandbox::SandboxRuntime;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strategies::{ActionDef, OpDef, UndoDef};

/// Confidence assigned to configured actions.
const EXTRA_ACTION_CONFIDENCE: f32 = 0.5;

/// What an action does.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionOperation {
    /// Run a repair command through the gate and sandbox.
    Command(CommandTemplate),
    /// Edit the fault's file in place.
    Edit(EditOp),
    /// Adjust the execution context for the retry.
    Config(ConfigOp),
}

/// How an action is undone.
#[derive(Clone, Debug, PartialEq)]
pub enum Rollback {
    None,
    /// Restore the file from the backup taken before the action.
    RestoreBackup,
    /// Run an undo command, gated like any repair.
    Command(CommandTemplate),
}

/// One candidate repair.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryAction {
    pub name: String,
    pub kind: ActionKind,
    pub operation: ActionOperation,
    /// Substrings that must all appear, case-insensitively, in the output.
    pub success_criteria: Vec<String>,
    pub confidence: f32,
    pub mutates_file: bool,
    pub rollback: Rollback,
}

impl RecoveryAction {
    fn from_def(def: &ActionDef) -> GuardResult<Self> {
        let operation = match def.op {
            OpDef::Command(template) => ActionOperation::Command(CommandTemplate::parse(template)?),
            OpDef::Edit(op) => ActionOperation::Edit(op),
            OpDef::Config(op) => ActionOperation::Config(op),
        };
        let rollback = match def.undo {
            UndoDef::None => Rollback::None,
            UndoDef::RestoreBackup => Rollback::RestoreBackup,
            UndoDef::Command(template) => Rollback::Command(CommandTemplate::parse(template)?),
        };
        Ok(Self {
            name: def.name.to_string(),
            kind: def.kind,
            operation,
            success_criteria: def
                .success_criteria
                .iter()
                .map(|criterion| (*criterion).to_string())
                .collect(),
            confidence: def.confidence,
            mutates_file: def.mutates_file,
            rollback,
        })
    }

    fn from_extra(extra: &ExtraAction) -> GuardResult<Self> {
        let rollback = match &extra.rollback_command {
            Some(command) => Rollback::Command(CommandTemplate::parse(command)?),
            None if extra.mutates_file => Rollback::RestoreBackup,
            None => Rollback::None,
        };
        Ok(Self {
            name: extra.name.clone(),
            kind: extra.kind,
            operation: ActionOperation::Command(CommandTemplate::parse(&extra.command)?),
            success_criteria: extra.success_criteria.clone(),
            confidence: EXTRA_ACTION_CONFIDENCE,
            mutates_file: extra.mutates_file,
            rollback,
        })
    }

    /// Whether the action could need a backup of `target`.
    fn needs_backup(&self, target: Option<&Path>) -> bool {
        let edits_existing = matches!(self.operation, ActionOperation::Edit(op) if op.touches_file())
            && target.is_some_and(Path::is_file);
        self.mutates_file || edits_existing
    }
}

/// Maps fault types to ordered candidate actions.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlanner {
    extra: Vec<(String, RecoveryAction)>,
}

impl RecoveryPlanner {
    /// Planner with the built-in strategies only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Planner that appends configured actions after the built-in ones.
    ///
    /// # Errors
    /// `E_TEMPLATE` if a configured command does not parse.
    pub fn with_extra_actions(extra: &[ExtraAction]) -> GuardResult<Self> {
        let extra = extra
            .iter()
            .map(|action| -> GuardResult<(String, RecoveryAction)> {
                Ok((action.fault_type.clone(), RecoveryAction::from_extra(action)?))
            })
            .collect::<GuardResult<Vec<_>>>()?;
        Ok(Self { extra })
    }

    /// Candidate actions for `fault_type`, most specific first. Empty when
    /// nothing is known to help.
    #[must_use]
    pub fn plan(&self, fault_type: &str) -> Vec<RecoveryAction> {
        let mut actions: Vec<RecoveryAction> = strategies::strategy_for(fault_type)
            .iter()
            .filter_map(|def| match RecoveryAction::from_def(def) {
                Ok(action) => Some(action),
                Err(err) => {
                    tracing::error!(action = def.name, %err, "built-in recovery action is invalid");
                    None
                }
            })
            .collect();
        actions.extend(
            self.extra
                .iter()
                .filter(|(planned_for, _)| planned_for == fault_type)
                .map(|(_, action)| action.clone()),
        );
        actions
    }
}

/// Result of [`RecoveryExecutor::attempt`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryAttempt {
    pub outcome: RecoveryOutcome,
    /// Context to use for the retry, when a config action changed it.
    pub retry_context: Option<ExecutionContext>,
}

/// Executes recovery actions.
#[derive(Debug, Clone)]
pub struct RecoveryExecutor {
    runtime: Arc<SandboxRuntime>,
    backups: Arc<BackupStore>,
    config: RecoveryConfig,
}

impl RecoveryExecutor {
    #[must_use]
    pub fn new(runtime: Arc<SandboxRuntime>, backups: Arc<BackupStore>, config: RecoveryConfig) -> Self {
        Self {
            runtime,
            backups,
            config,
        }
    }

    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Timeout for one attempt: the configured ceiling, and always below
    /// the outer timeout.
    #[must_use]
    pub fn attempt_timeout(&self, outer: Duration) -> Duration {
        let outer_ms = duration_to_ms(outer);
        let below_outer = outer_ms.saturating_sub(outer_ms / 4).max(1);
        Duration::from_millis(self.config.attempt_timeout_ms.min(below_outer))
    }

    /// Execute `action` for `fault`.
    ///
    /// Failures of the action itself are reported in the outcome. Only
    /// harness failures, such as a backup that cannot be written or a
    /// rollback that fails verification, are returned as errors.
    ///
    /// # Errors
    /// `E_IO` or `E_INTEGRITY` from the backup store.
    pub fn attempt(
        &self,
        action: &RecoveryAction,
        fault: &DetectedFault,
        context: &ExecutionContext,
    ) -> GuardResult<RecoveryAttempt> {
        let started = Instant::now();
        let mut outcome = blank_outcome(action, fault);
        let target = fault.file_path.as_deref();

        if action.needs_backup(target) {
            match self.take_backup(target) {
                Ok(record) => outcome.backup = Some(record),
                Err(err) if err.code == ErrorCode::InvalidContext => {
                    outcome.error = Some(err.to_string());
                    outcome.duration_ms = duration_to_ms(started.elapsed());
                    return Ok(RecoveryAttempt {
                        outcome,
                        retry_context: None,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let mut retry_context = None;
        match &action.operation {
            ActionOperation::Command(template) => {
                self.run_command(action, template, fault, context, &mut outcome);
            }
            ActionOperation::Edit(op) => apply_edit(*op, fault, &mut outcome),
            ActionOperation::Config(op) => {
                retry_context = self.apply_config(*op, context, &mut outcome);
            }
        }

        if !outcome.success && self.config.rollback_failed_actions {
            if let Some(record) = outcome.backup.clone() {
                tracing::warn!(action = %action.name, "recovery action failed, restoring backup");
                self.backups.restore(&record)?;
                outcome.rollback_performed = true;
            }
        }
        outcome.duration_ms = duration_to_ms(started.elapsed());
        tracing::info!(
            action = %action.name,
            success = outcome.success,
            rollback = outcome.rollback_performed,
            "recovery attempt finished"
        );
        Ok(RecoveryAttempt {
            outcome,
            retry_context,
        })
    }

    /// Undo a previous outcome: restore its backup, or run its undo command.
    #[must_use]
    pub fn rollback(&self, outcome: &RecoveryOutcome, context: &ExecutionContext) -> RecoveryOutcome {
        let started = Instant::now();
        let mut undo = RecoveryOutcome {
            action_name: format!("rollback:{}", outcome.action_name),
            action_kind: outcome.action_kind,
            fault_id: outcome.fault_id,
            operation: None,
            success: false,
            output: String::new(),
            error: None,
            exit_code: None,
            rollback_performed: false,
            backup: outcome.backup.clone(),
            rollback_command: None,
            security_violations: Vec::new(),
            duration_ms: 0,
        };
        if let Some(record) = &outcome.backup {
            undo.operation = Some(format!("restore {}", record.original_path.display()));
            match self.backups.restore(record) {
                Ok(()) => {
                    undo.success = true;
                    undo.rollback_performed = true;
                }
                Err(err) => undo.error = Some(err.to_string()),
            }
        } else if let Some(command) = &outcome.rollback_command {
            undo.operation = Some(command.clone());
            self.run_gated(command, &[], false, context, &mut undo);
            undo.rollback_performed = undo.success;
        } else {
            undo.error = Some("outcome has nothing to roll back".to_string());
        }
        undo.duration_ms = duration_to_ms(started.elapsed());
        undo
    }

    fn take_backup(&self, target: Option<&Path>) -> GuardResult<BackupRecord> {
        let target = target.ok_or_else(|| {
            GuardError::invalid_context("fault names no file to act on", None)
        })?;
        self.backups.snapshot(target)
    }

    fn run_command(
        &self,
        action: &RecoveryAction,
        template: &CommandTemplate,
        fault: &DetectedFault,
        context: &ExecutionContext,
        outcome: &mut RecoveryOutcome,
    ) {
        let bindings = SlotBindings::from_fault(fault, context.working_directory());
        let command = match template.render(&bindings) {
            Ok(command) => command,
            Err(err) => {
                outcome.error = Some(err.to_string());
                return;
            }
        };
        if let Rollback::Command(undo) = &action.rollback {
            outcome.rollback_command = undo.render(&bindings).ok();
        }
        outcome.operation = Some(command.clone());
        let attempt_context = match context.with_timeout(self.attempt_timeout(context.timeout())) {
            Ok(attempt_context) => attempt_context,
            Err(err) => {
                outcome.error = Some(err.to_string());
                return;
            }
        };
        self.run_gated(
            &command,
            &action.success_criteria,
            action.mutates_file,
            &attempt_context,
            outcome,
        );
    }

    /// Repair-prefix check, then a sandboxed run; fills `outcome`.
    fn run_gated(
        &self,
        command: &str,
        criteria: &[String],
        write_back: bool,
        context: &ExecutionContext,
        outcome: &mut RecoveryOutcome,
    ) {
        let violations = self.runtime.gate().check_repair(command);
        if !violations.is_empty() {
            tracing::warn!(command, "repair command refused by security gate");
            outcome.error = Some("repair command refused by security policy".to_string());
            outcome.security_violations = violations;
            return;
        }
        let result = self.runtime.run(command, &context.with_write_back(write_back));
        let output = result.combined_output();
        outcome.success = result.success && criteria_met(&output, criteria);
        if result.success && !outcome.success {
            outcome.error = Some("success criteria not found in output".to_string());
        } else if !result.success {
            outcome.error = result
                .error
                .clone()
                .or_else(|| Some(format!("exited with code {}", result.exit_code)));
        }
        outcome.exit_code = Some(result.exit_code);
        outcome.security_violations = result.security_violations;
        outcome.output = output;
    }

    fn apply_config(
        &self,
        op: ConfigOp,
        context: &ExecutionContext,
        outcome: &mut RecoveryOutcome,
    ) -> Option<ExecutionContext> {
        let current = context.timeout_ms();
        let Some(adjusted) = op.adjusted_timeout_ms(current, self.config.max_timeout_ms) else {
            outcome.error = Some(format!(
                "timeout {current}ms is already at the {}ms cap",
                self.config.max_timeout_ms
            ));
            return None;
        };
        outcome.operation = Some(format!("{} {current}ms -> {adjusted}ms", op.as_str()));
        match context.with_timeout(Duration::from_millis(adjusted)) {
            Ok(adjusted_context) => {
                outcome.success = true;
                outcome.output = format!("timeout set to {adjusted}ms");
                Some(adjusted_context)
            }
            Err(err) => {
                outcome.error = Some(err.to_string());
                None
            }
        }
    }
}

fn apply_edit(op: EditOp, fault: &DetectedFault, outcome: &mut RecoveryOutcome) {
    let Some(path) = fault.file_path.as_deref() else {
        outcome.error = Some("fault names no file to edit".to_string());
        return;
    };
    outcome.operation = Some(format!("{} {}", op.as_str(), path.display()));
    match op.apply(path, fault.line_number) {
        Ok(Some(description)) => {
            outcome.success = true;
            outcome.output = description;
        }
        Ok(None) => outcome.error = Some("edit does not apply to this file".to_string()),
        Err(err) => outcome.error = Some(err.to_string()),
    }
}

/// Every criterion appears in `output`, ignoring case.
fn criteria_met(output: &str, criteria: &[String]) -> bool {
    let haystack = output.to_lowercase();
    criteria
        .iter()
        .all(|criterion| haystack.contains(&criterion.to_lowercase()))
}

fn blank_outcome(action: &RecoveryAction, fault: &DetectedFault) -> RecoveryOutcome {
    RecoveryOutcome {
        action_name: action.name.clone(),
        action_kind: action.kind,
        fault_id: fault.id,
        operation: None,
        success: false,
        output: String::new(),
        error: None,
        exit_code: None,
        rollback_performed: false,
        backup: None,
        rollback_command: None,
        security_violations: Vec::new(),
        duration_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_builtin_before_configured() {
        let extra = ExtraAction {
            fault_type: "import_error".to_string(),
            name: "uv_add".to_string(),
            kind: ActionKind::Install,
            command: "uv add {package_name}".to_string(),
            success_criteria: Vec::new(),
            mutates_file: false,
            rollback_command: None,
        };
        let planner = RecoveryPlanner::with_extra_actions(&[extra]).unwrap();
        let names: Vec<_> = planner
            .plan("import_error")
            .into_iter()
            .map(|action| action.name)
            .collect();
        assert_eq!(names, vec!["pip_install", "python_module_pip_install", "uv_add"]);
        assert!(planner.plan("attribute_error").is_empty());
    }

    #[test]
    fn criteria_match_ignores_case() {
        let criteria = vec!["successfully installed".to_string()];
        assert!(criteria_met("Successfully installed foo-1.0", &criteria));
        assert!(!criteria_met("ERROR: no matching distribution", &criteria));
        assert!(criteria_met("anything", &[]));
    }

    #[test]
    fn edit_actions_back_up_existing_targets_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.py");
        std::fs::write(&file, "x").unwrap();
        let planner = RecoveryPlanner::new();
        let colon = planner.plan("syntax_error").into_iter().next().unwrap();
        assert!(colon.needs_backup(Some(&file)));
        let parent = planner.plan("file_not_found").into_iter().next().unwrap();
        assert!(!parent.needs_backup(Some(&dir.path().join("missing/file.txt"))));
    }
}
