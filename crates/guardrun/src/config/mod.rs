//! Configuration for the gate, sandbox, recovery and ledger.
//!
//! A [`GuardConfig`] is plain data: every field has a default, so an empty
//! JSON object or YAML document is a valid configuration. Files are loaded
//! with [`load_config_file`] and checked with [`validate_config`] before any
//! component is built from them.

mod builder;

pub use builder::ConfigBuilder;

use crate::error::{GuardError, GuardResult};
use crate::model::{ActionKind, MAX_REGEX_PATTERN_LEN};
use crate::recovery::CommandTemplate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current configuration format version.
pub const CONFIG_VERSION: u32 = 1;

/// Source extensions copied into a sandbox workspace by default.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "pyi", "js", "mjs", "cjs", "ts", "tsx", "jsx", "json", "rs", "go", "mod", "sum", "java",
    "kt", "rb", "php", "c", "h", "cc", "cpp", "hpp", "cs", "swift", "sh", "toml", "yaml", "yml",
    "cfg", "ini", "txt", "md", "lock", "html", "css", "sql",
];

/// PATH given to sandboxed processes.
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub config_version: u32,
    pub gate: GatePolicy,
    pub sandbox: SandboxConfig,
    pub recovery: RecoveryConfig,
    pub ledger: LedgerConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            gate: GatePolicy::default(),
            sandbox: SandboxConfig::default(),
            recovery: RecoveryConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// Roots and extensions to the built-in gate tables.
///
/// The built-in denylists cannot be switched off; configuration only adds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    /// Project checkout the agent works in.
    pub project_root: Option<PathBuf>,
    /// Designated scratch area outside the project.
    pub workspace_root: Option<PathBuf>,
    /// Allow working directories under the system temp dir.
    pub allow_temp_root: bool,
    /// Additional program names refused as leading tokens.
    pub denied_programs: Vec<String>,
    /// Additional dangerous-pattern regexes.
    pub dangerous_patterns: Vec<String>,
    /// Additional repair-tool prefixes accepted for recovery commands.
    pub repair_prefixes: Vec<String>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            project_root: None,
            workspace_root: None,
            allow_temp_root: true,
            denied_programs: Vec::new(),
            dangerous_patterns: Vec::new(),
            repair_prefixes: Vec::new(),
        }
    }
}

/// Hard ceilings applied to every sandboxed process. `None` means unlimited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_time_secs: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(4 * 1024 * 1024 * 1024),
            cpu_time_secs: Some(120),
            file_size_bytes: Some(256 * 1024 * 1024),
        }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            memory_bytes: None,
            cpu_time_secs: None,
            file_size_bytes: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub limits: ResourceLimits,
    /// Apply limits with `setrlimit` at spawn; otherwise only sample post hoc.
    pub enforce_limits: bool,
    /// Lowercase extensions without the leading dot.
    pub allowed_extensions: Vec<String>,
    pub path: String,
    pub shell: PathBuf,
    pub max_workspace_files: usize,
    pub max_workspace_bytes: u64,
    pub sample_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when tearing down a process group.
    pub kill_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            enforce_limits: true,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| (*ext).to_string())
                .collect(),
            path: DEFAULT_SANDBOX_PATH.to_string(),
            shell: PathBuf::from("/bin/sh"),
            max_workspace_files: 10_000,
            max_workspace_bytes: 256 * 1024 * 1024,
            sample_interval_ms: 50,
            kill_grace_ms: 200,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Ceiling for one repair attempt; always kept below the outer timeout.
    pub attempt_timeout_ms: u64,
    /// Cap for timeout-extension config actions.
    pub max_timeout_ms: u64,
    /// Where backups are written. Defaults to a directory under the temp dir.
    pub backup_dir: Option<PathBuf>,
    /// Restore the backup as soon as a mutating action fails.
    pub rollback_failed_actions: bool,
    /// Command actions tried after the built-in ones for a fault type.
    pub extra_actions: Vec<ExtraAction>,
}

/// A configured recovery command.
///
/// The command is a template using the `{file_path}`, `{package_name}`,
/// `{command_name}` and `{line_number}` slots, and must start with a repair
/// prefix the gate accepts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraAction {
    pub fault_type: String,
    pub name: String,
    #[serde(default = "default_extra_kind")]
    pub kind: ActionKind,
    pub command: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub mutates_file: bool,
    #[serde(default)]
    pub rollback_command: Option<String>,
}

fn default_extra_kind() -> ActionKind {
    ActionKind::Command
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 60_000,
            max_timeout_ms: 600_000,
            backup_dir: None,
            rollback_failed_actions: true,
            extra_actions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum retained fault entries; counters survive eviction.
    pub capacity: usize,
    /// How many recent entries are searched for related faults.
    pub related_window: usize,
    /// How many related faults are attached to a new fault.
    pub max_related: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            related_window: 10,
            max_related: 3,
        }
    }
}

/// Load a configuration from a JSON or YAML file (by extension).
///
/// # Errors
/// `E_IO` if the file cannot be read, `E_CONFIG` if it does not parse or
/// fails [`validate_config`].
pub fn load_config_file(path: &Path) -> GuardResult<GuardConfig> {
    let data = fs::read_to_string(path)
        .map_err(|err| GuardError::io("failed to read config file", err))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let config: GuardConfig = if is_yaml {
        serde_yml::from_str(&data).map_err(|err| {
            GuardError::config(
                "failed to parse yaml config",
                serde_json::json!({ "path": path, "source": err.to_string() }),
            )
        })?
    } else {
        serde_json::from_str(&data).map_err(|err| {
            GuardError::config(
                "failed to parse json config",
                serde_json::json!({ "path": path, "source": err.to_string() }),
            )
        })?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Check version and value ranges.
///
/// # Errors
/// `E_CONFIG` describing the first offending field.
pub fn validate_config(config: &GuardConfig) -> GuardResult<()> {
    if config.config_version != CONFIG_VERSION {
        return Err(GuardError::config(
            format!(
                "unsupported config_version {}, expected {}",
                config.config_version, CONFIG_VERSION
            ),
            serde_json::json!({
                "received_version": config.config_version,
                "expected_version": CONFIG_VERSION,
                "fix": format!("Set config_version to {CONFIG_VERSION}"),
            }),
        ));
    }
    for root in [&config.gate.project_root, &config.gate.workspace_root]
        .into_iter()
        .flatten()
    {
        if !root.is_absolute() {
            return Err(GuardError::config(
                "gate roots must be absolute paths",
                serde_json::json!({ "path": root }),
            ));
        }
    }
    for pattern in &config.gate.dangerous_patterns {
        if pattern.len() > MAX_REGEX_PATTERN_LEN {
            return Err(GuardError::config(
                "dangerous pattern exceeds maximum length",
                serde_json::json!({ "length": pattern.len(), "max": MAX_REGEX_PATTERN_LEN }),
            ));
        }
    }
    let sandbox = &config.sandbox;
    if sandbox.allowed_extensions.is_empty() {
        return Err(GuardError::config(
            "sandbox.allowed_extensions must not be empty",
            None,
        ));
    }
    if let Some(bad) = sandbox
        .allowed_extensions
        .iter()
        .find(|ext| ext.is_empty() || ext.starts_with('.') || ext.chars().any(char::is_uppercase))
    {
        return Err(GuardError::config(
            "extensions must be lowercase and written without a leading dot",
            serde_json::json!({ "extension": bad }),
        ));
    }
    if sandbox.path.trim().is_empty() {
        return Err(GuardError::config("sandbox.path must not be empty", None));
    }
    if !sandbox.shell.is_absolute() {
        return Err(GuardError::config(
            "sandbox.shell must be an absolute path",
            serde_json::json!({ "shell": sandbox.shell }),
        ));
    }
    if sandbox.sample_interval_ms == 0 {
        return Err(GuardError::config(
            "sandbox.sample_interval_ms must be greater than zero",
            None,
        ));
    }
    let recovery = &config.recovery;
    if recovery.attempt_timeout_ms == 0 || recovery.max_timeout_ms < recovery.attempt_timeout_ms {
        return Err(GuardError::config(
            "recovery timeouts must satisfy 0 < attempt_timeout_ms <= max_timeout_ms",
            serde_json::json!({
                "attempt_timeout_ms": recovery.attempt_timeout_ms,
                "max_timeout_ms": recovery.max_timeout_ms,
            }),
        ));
    }
    for action in &recovery.extra_actions {
        validate_extra_action(action)?;
    }
    if config.ledger.capacity == 0 {
        return Err(GuardError::config("ledger.capacity must be greater than zero", None));
    }
    Ok(())
}

fn validate_extra_action(action: &ExtraAction) -> GuardResult<()> {
    if action.name.trim().is_empty() || action.fault_type.trim().is_empty() {
        return Err(GuardError::config(
            "recovery.extra_actions entries need a name and a fault_type",
            serde_json::json!({ "name": action.name, "fault_type": action.fault_type }),
        ));
    }
    if !action.kind.runs_process() {
        return Err(GuardError::config(
            "recovery.extra_actions must be command or install actions",
            serde_json::json!({ "name": action.name, "kind": action.kind }),
        ));
    }
    CommandTemplate::parse(&action.command)?;
    if let Some(rollback) = &action.rollback_command {
        CommandTemplate::parse(rollback)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn empty_json_is_default_config() {
        let config: GuardConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GuardConfig::default());
        validate_config(&config).unwrap();
    }

    #[test]
    fn wrong_version_is_rejected() {
        let config = GuardConfig {
            config_version: 99,
            ..GuardConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::Config);
        assert!(err.message.contains("config_version"));
    }

    #[test]
    fn dotted_extension_is_rejected() {
        let mut config = GuardConfig::default();
        config.sandbox.allowed_extensions = vec![".py".to_string()];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn attempt_timeout_above_cap_is_rejected() {
        let mut config = GuardConfig::default();
        config.recovery.attempt_timeout_ms = 10_000;
        config.recovery.max_timeout_ms = 5_000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn yaml_and_json_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("guardrun.yaml");
        fs::write(
            &yaml,
            "gate:\n  allow_temp_root: false\nrecovery:\n  attempt_timeout_ms: 5000\n",
        )
        .unwrap();
        let config = load_config_file(&yaml).unwrap();
        assert!(!config.gate.allow_temp_root);
        assert_eq!(config.recovery.attempt_timeout_ms, 5000);

        let json = dir.path().join("guardrun.json");
        fs::write(&json, r#"{"ledger": {"capacity": 5}}"#).unwrap();
        let config = load_config_file(&json).unwrap();
        assert_eq!(config.ledger.capacity, 5);
    }

    #[test]
    fn extra_action_templates_are_checked() {
        let mut config = GuardConfig::default();
        config.recovery.extra_actions.push(ExtraAction {
            fault_type: "import_error".to_string(),
            name: "uv_add".to_string(),
            kind: ActionKind::Install,
            command: "uv add {package}".to_string(),
            success_criteria: Vec::new(),
            mutates_file: false,
            rollback_command: None,
        });
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::Template);
    }
}
