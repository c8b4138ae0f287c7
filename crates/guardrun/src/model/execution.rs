use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exit code reported when the harness killed a process for exceeding its
/// wall-clock timeout (same value as coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when nothing ran (gate refusal or spawn failure).
pub const NOT_RUN_EXIT_CODE: i32 = -1;

/// Why the gate refused something.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DeniedCommand,
    DangerousPattern,
    WorkingDirectory,
    Environment,
    RepairNotAllowed,
}

/// One pre-flight policy refusal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub message: String,
    /// The offending token, pattern, path or variable.
    pub subject: String,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            subject: subject.into(),
        }
    }
}

/// Which resource ceiling was breached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    CpuTime,
    FileSize,
}

/// A resource ceiling breach, raised by the OS limit or by post-hoc sampling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub resource: ResourceKind,
    pub limit: u64,
    pub observed: Option<u64>,
    pub message: String,
}

/// Peak resource usage sampled for the process group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// False when the platform offers no sampling or the run was too short.
    pub sampled: bool,
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
    /// Number of distinct processes seen in the group.
    pub processes_seen: u32,
}

/// Terminal state of one sandboxed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Exited with status zero and no resource violation.
    Succeeded,
    /// Exited with a non-zero status.
    Failed,
    /// Killed by the harness at the wall-clock deadline.
    TimedOut,
    /// Breached a resource ceiling.
    ResourceViolation,
    /// Refused by the security gate; nothing was spawned.
    Rejected,
    /// The process could not be started.
    SpawnFailed,
}

/// Outcome of one sandboxed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: String,
    pub success: bool,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub security_violations: Vec<SecurityViolation>,
    pub resource_violations: Vec<ResourceViolation>,
    pub resource_usage: ResourceUsage,
    /// Files copied back from the workspace when write-back was requested.
    pub modified_files: Vec<PathBuf>,
    /// Where the ephemeral workspace lived while the process ran.
    pub workspace_dir: Option<PathBuf>,
    /// Harness-side error text (spawn failure, workspace failure).
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result for a command the gate refused. Nothing ran.
    #[must_use]
    pub fn rejected(command: impl Into<String>, violations: Vec<SecurityViolation>) -> Self {
        let mut result = Self::not_run(command, ExecutionStatus::Rejected);
        result.error = Some("command refused by security policy".to_string());
        result.security_violations = violations;
        result
    }

    /// Result for a command that could not be started.
    #[must_use]
    pub fn spawn_failed(command: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        let mut result = Self::not_run(command, ExecutionStatus::SpawnFailed);
        result.error = Some(error.into());
        result.duration_ms = duration_to_ms(duration);
        result
    }

    fn not_run(command: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            command: command.into(),
            success: false,
            status,
            exit_code: NOT_RUN_EXIT_CODE,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration_ms: 0,
            timed_out: false,
            security_violations: Vec::new(),
            resource_violations: Vec::new(),
            resource_usage: ResourceUsage::default(),
            modified_files: Vec::new(),
            workspace_dir: None,
            error: None,
        }
    }

    /// Derive `success` and `status` from the raw fields.
    ///
    /// A run is successful only when it exited zero, was not killed at the
    /// deadline, and recorded no resource violation.
    pub(crate) fn finalize(&mut self) {
        self.status = if self.timed_out {
            ExecutionStatus::TimedOut
        } else if !self.resource_violations.is_empty() {
            ExecutionStatus::ResourceViolation
        } else if self.exit_code == 0 {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        self.success = matches!(self.status, ExecutionStatus::Succeeded);
    }

    #[must_use]
    pub fn was_rejected(&self) -> bool {
        matches!(self.status, ExecutionStatus::Rejected)
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.duration().as_secs_f64()
    }

    /// Stdout followed by stderr, the text the classifier sees.
    #[must_use]
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
