use crate::model::{BackupRecord, FaultId, SecurityViolation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broad family of a repair action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Run a repair tool.
    Command,
    /// Edit the referenced file in place.
    FileEdit,
    /// Run a package manager.
    Install,
    /// Adjust the execution settings for the retry.
    Config,
}

impl ActionKind {
    /// Whether the action runs a process through the sandbox.
    #[must_use]
    pub fn runs_process(self) -> bool {
        matches!(self, Self::Command | Self::Install)
    }
}

/// Result of executing one recovery action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub action_name: String,
    pub action_kind: ActionKind,
    pub fault_id: FaultId,
    /// The instantiated command or a description of the edit.
    pub operation: Option<String>,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub rollback_performed: bool,
    pub backup: Option<BackupRecord>,
    /// Instantiated undo command for actions without a file backup.
    pub rollback_command: Option<String>,
    pub security_violations: Vec<SecurityViolation>,
    pub duration_ms: u64,
}

impl RecoveryOutcome {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
