//! Isolated process execution.
//!
//! [`SandboxRuntime::run`] is the only way the crate starts a process:
//!
//! 1. the [`SecurityGate`] approves the command, working directory and
//!    environment (refusal returns before anything is spawned);
//! 2. an ephemeral workspace is materialized from the working directory;
//! 3. `/bin/sh -c <command>` runs in its own process group under the
//!    configured [`ResourceLimiter`], with a minimal environment;
//! 4. the group is supervised until exit or the wall-clock deadline, and
//!    sampled for memory and CPU time;
//! 5. changed files are optionally written back.
//!
//! Every failure mode is a normal [`ExecutionResult`]; `run` never returns
//! an error.

mod code;
mod env;
mod limits;
mod process;
mod workspace;

pub use code::{CodeRunner, Interpreter, PreparedCode};
pub use limits::{default_limiter, ResourceLimiter, RlimitLimiter, SoftLimiter};

use crate::config::{ResourceLimits, SandboxConfig};
use crate::gate::SecurityGate;
use crate::model::execution::duration_to_ms;
use crate::model::{
    ExecutionContext, ExecutionResult, ExecutionStatus, ResourceKind, ResourceUsage,
    ResourceViolation, TIMEOUT_EXIT_CODE,
};
use process::{ProcessOutcome, SpawnRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};
use workspace::Workspace;

#[cfg(unix)]
const SIGXCPU: i32 = nix::sys::signal::Signal::SIGXCPU as i32;
#[cfg(unix)]
const SIGXFSZ: i32 = nix::sys::signal::Signal::SIGXFSZ as i32;

/// Gated, resource-bounded command execution.
#[derive(Debug)]
pub struct SandboxRuntime {
    gate: Arc<SecurityGate>,
    config: SandboxConfig,
    limiter: Box<dyn ResourceLimiter>,
}

impl SandboxRuntime {
    /// Runtime with the limiter chosen by `config.enforce_limits`.
    #[must_use]
    pub fn new(gate: Arc<SecurityGate>, config: SandboxConfig) -> Self {
        let limiter = default_limiter(config.enforce_limits);
        Self {
            gate,
            config,
            limiter,
        }
    }

    #[must_use]
    pub fn with_limiter(mut self, limiter: Box<dyn ResourceLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    #[must_use]
    pub fn limiter(&self) -> &dyn ResourceLimiter {
        self.limiter.as_ref()
    }

    /// Gate, then execute `command` under `context`.
    #[must_use]
    pub fn run(&self, command: &str, context: &ExecutionContext) -> ExecutionResult {
        let violations = self.gate.check(command, context);
        if !violations.is_empty() {
            tracing::warn!(
                command,
                violations = violations.len(),
                "command refused by security gate"
            );
            return ExecutionResult::rejected(command, violations);
        }
        self.run_approved(command, context)
    }

    fn run_approved(&self, command: &str, context: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        let workspace = match Workspace::materialize(context.working_directory(), &self.config) {
            Ok(workspace) => workspace,
            Err(err) => {
                tracing::warn!(%err, "failed to prepare sandbox workspace");
                return ExecutionResult::spawn_failed(command, err.to_string(), started.elapsed());
            }
        };
        tracing::debug!(
            workspace = %workspace.root().display(),
            files = workspace.file_count(),
            "sandbox workspace ready"
        );
        let env = env::build_environment(context, &workspace.harness_dir(), &self.config.path);
        let request = SpawnRequest {
            shell: &self.config.shell,
            command,
            cwd: workspace.root(),
            env: &env,
            limits: &self.config.limits,
            limiter: self.limiter.as_ref(),
            timeout: context.timeout(),
            max_output_bytes: context.max_output_bytes(),
            sample_interval: Duration::from_millis(self.config.sample_interval_ms),
            kill_grace: Duration::from_millis(self.config.kill_grace_ms),
        };
        let outcome = match process::run_process(&request) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(%err, "sandboxed process could not be run");
                return ExecutionResult::spawn_failed(command, err.to_string(), started.elapsed());
            }
        };

        let mut result = self.assemble(command, &workspace, outcome);
        if context.write_back() && !result.timed_out {
            match workspace.write_back() {
                Ok(files) => result.modified_files = files,
                Err(err) => {
                    tracing::warn!(%err, "write-back failed");
                    result.error = Some(err.to_string());
                }
            }
        }
        result.finalize();
        tracing::info!(
            command,
            exit_code = result.exit_code,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "sandboxed execution finished"
        );
        result
    }

    fn assemble(
        &self,
        command: &str,
        workspace: &Workspace,
        outcome: ProcessOutcome,
    ) -> ExecutionResult {
        let exit_code = if outcome.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            outcome
                .exit_code
                .or_else(|| outcome.signal.map(|signal| 128 + signal))
                .unwrap_or(crate::model::NOT_RUN_EXIT_CODE)
        };
        let resource_violations = if outcome.timed_out {
            Vec::new()
        } else {
            resource_violations(&self.config.limits, &outcome.usage, outcome.signal)
        };
        ExecutionResult {
            command: command.to_string(),
            success: false,
            status: ExecutionStatus::Failed,
            exit_code,
            signal: outcome.signal,
            stdout: outcome.stdout.text,
            stderr: outcome.stderr.text,
            stdout_truncated: outcome.stdout.truncated,
            stderr_truncated: outcome.stderr.truncated,
            duration_ms: duration_to_ms(outcome.duration),
            timed_out: outcome.timed_out,
            security_violations: Vec::new(),
            resource_violations,
            resource_usage: outcome.usage,
            modified_files: Vec::new(),
            workspace_dir: Some(workspace.root().to_path_buf()),
            error: None,
        }
    }
}

/// Violations from the terminating signal and from post-hoc samples.
fn resource_violations(
    limits: &ResourceLimits,
    usage: &ResourceUsage,
    signal: Option<i32>,
) -> Vec<ResourceViolation> {
    let mut violations = Vec::new();
    #[cfg(unix)]
    match signal {
        Some(SIGXCPU) => violations.push(ResourceViolation {
            resource: ResourceKind::CpuTime,
            limit: limits.cpu_time_secs.unwrap_or_default().saturating_mul(1000),
            observed: usage.sampled.then_some(usage.cpu_time_ms),
            message: "process killed for exceeding its CPU time limit".to_string(),
        }),
        Some(SIGXFSZ) => violations.push(ResourceViolation {
            resource: ResourceKind::FileSize,
            limit: limits.file_size_bytes.unwrap_or_default(),
            observed: None,
            message: "process killed for exceeding the maximum file size".to_string(),
        }),
        _ => {}
    }
    #[cfg(not(unix))]
    let _ = signal;

    if let Some(limit) = limits.memory_bytes {
        if usage.sampled && usage.peak_memory_bytes > limit {
            violations.push(ResourceViolation {
                resource: ResourceKind::Memory,
                limit,
                observed: Some(usage.peak_memory_bytes),
                message: format!(
                    "peak resident memory {} bytes exceeded the {limit} byte limit",
                    usage.peak_memory_bytes
                ),
            });
        }
    }
    let cpu_already_reported = violations
        .iter()
        .any(|violation| violation.resource == ResourceKind::CpuTime);
    if let Some(secs) = limits.cpu_time_secs {
        let limit_ms = secs.saturating_mul(1000);
        if usage.sampled && usage.cpu_time_ms > limit_ms && !cpu_already_reported {
            violations.push(ResourceViolation {
                resource: ResourceKind::CpuTime,
                limit: limit_ms,
                observed: Some(usage.cpu_time_ms),
                message: format!(
                    "sampled CPU time {}ms exceeded the {limit_ms}ms limit",
                    usage.cpu_time_ms
                ),
            });
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled(peak_memory_bytes: u64, cpu_time_ms: u64) -> ResourceUsage {
        ResourceUsage {
            sampled: true,
            peak_memory_bytes,
            cpu_time_ms,
            processes_seen: 1,
        }
    }

    #[test]
    fn samples_above_limits_are_violations() {
        let limits = ResourceLimits {
            memory_bytes: Some(1000),
            cpu_time_secs: Some(1),
            file_size_bytes: None,
        };
        let violations = resource_violations(&limits, &sampled(2000, 1500), None);
        let kinds: Vec<_> = violations.iter().map(|v| v.resource).collect();
        assert_eq!(kinds, vec![ResourceKind::Memory, ResourceKind::CpuTime]);
    }

    #[test]
    fn unsampled_usage_raises_nothing() {
        let limits = ResourceLimits {
            memory_bytes: Some(1),
            cpu_time_secs: Some(1),
            file_size_bytes: Some(1),
        };
        assert!(resource_violations(&limits, &ResourceUsage::default(), None).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn limit_signals_are_violations() {
        let limits = ResourceLimits::default();
        let cpu = resource_violations(&limits, &sampled(0, 0), Some(SIGXCPU));
        assert_eq!(cpu.len(), 1);
        assert_eq!(cpu.first().map(|v| v.resource), Some(ResourceKind::CpuTime));
        let fsize = resource_violations(&limits, &ResourceUsage::default(), Some(SIGXFSZ));
        assert_eq!(fsize.first().map(|v| v.resource), Some(ResourceKind::FileSize));
    }
}
