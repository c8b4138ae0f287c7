use super::{ExtraAction, GuardConfig, ResourceLimits};
use crate::error::GuardResult;
use std::path::PathBuf;

/// Fluent builder for [`GuardConfig`].
///
/// # Example
///
/// ```
/// use guardrun::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .project_root("/srv/project")
///     .memory_limit_bytes(512 * 1024 * 1024)
///     .attempt_timeout_ms(10_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.recovery.attempt_timeout_ms, 10_000);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: GuardConfig,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn from_config(config: GuardConfig) -> Self {
        Self { config }
    }

    // =========================================================================
    // Gate
    // =========================================================================

    #[must_use]
    pub fn project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.gate.project_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.gate.workspace_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn allow_temp_root(mut self, allow: bool) -> Self {
        self.config.gate.allow_temp_root = allow;
        self
    }

    #[must_use]
    pub fn deny_program(mut self, program: impl Into<String>) -> Self {
        self.config.gate.denied_programs.push(program.into());
        self
    }

    #[must_use]
    pub fn dangerous_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.gate.dangerous_patterns.push(pattern.into());
        self
    }

    #[must_use]
    pub fn repair_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.gate.repair_prefixes.push(prefix.into());
        self
    }

    // =========================================================================
    // Sandbox
    // =========================================================================

    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.config.sandbox.limits = limits;
        self
    }

    #[must_use]
    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.config.sandbox.limits.memory_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn cpu_limit_secs(mut self, secs: u64) -> Self {
        self.config.sandbox.limits.cpu_time_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn file_size_limit_bytes(mut self, bytes: u64) -> Self {
        self.config.sandbox.limits.file_size_bytes = Some(bytes);
        self
    }

    /// Disable spawn-time rlimits; only post-hoc sampling remains.
    #[must_use]
    pub fn soft_limits(mut self) -> Self {
        self.config.sandbox.enforce_limits = false;
        self
    }

    #[must_use]
    pub fn allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.sandbox.allowed_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn sandbox_path(mut self, path: impl Into<String>) -> Self {
        self.config.sandbox.path = path.into();
        self
    }

    #[must_use]
    pub fn workspace_ceilings(mut self, max_files: usize, max_bytes: u64) -> Self {
        self.config.sandbox.max_workspace_files = max_files;
        self.config.sandbox.max_workspace_bytes = max_bytes;
        self
    }

    // =========================================================================
    // Recovery and ledger
    // =========================================================================

    #[must_use]
    pub fn attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.config.recovery.attempt_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn max_timeout_ms(mut self, ms: u64) -> Self {
        self.config.recovery.max_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.recovery.backup_dir = Some(dir.into());
        self
    }

    /// Append a configured recovery command.
    #[must_use]
    pub fn extra_action(mut self, action: ExtraAction) -> Self {
        self.config.recovery.extra_actions.push(action);
        self
    }

    #[must_use]
    pub fn ledger_capacity(mut self, capacity: usize) -> Self {
        self.config.ledger.capacity = capacity;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    /// `E_CONFIG` when a value is out of range, see
    /// [`validate_config`](super::validate_config).
    pub fn build(self) -> GuardResult<GuardConfig> {
        super::validate_config(&self.config)?;
        Ok(self.config)
    }

    /// Return the configuration without validating it.
    #[must_use]
    pub fn build_unchecked(self) -> GuardConfig {
        self.config
    }
}
