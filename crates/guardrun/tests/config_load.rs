// Test module - relaxed lint rules
#![allow(clippy::default_trait_access)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::inefficient_to_string)]
#![allow(clippy::panic)]
#![allow(clippy::manual_assert)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::cast_possible_truncation)]
#![allow(missing_docs)]

//! Loading configuration files and building an orchestrator from them.

use guardrun::config::{validate_config, ExtraAction};
use guardrun::{
    load_config_file, ActionKind, ConfigBuilder, ErrorCode, GuardConfig, RecoveryPlanner,
    SafetyOrchestrator,
};
use std::fs;

#[test]
fn yaml_config_with_extra_actions_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guardrun.yaml");
    let yaml = format!(
        "\
config_version: 1
gate:
  project_root: {root}
  denied_programs: [nc]
  repair_prefixes: [\"uv add\"]
sandbox:
  allowed_extensions: [py, toml]
  limits:
    memory_bytes: 268435456
    cpu_time_secs: 10
recovery:
  attempt_timeout_ms: 5000
  extra_actions:
    - fault_type: import_error
      name: uv_add
      kind: install
      command: uv add {{package_name}}
      success_criteria: [resolved]
      rollback_command: uv remove {{package_name}}
ledger:
  capacity: 50
",
        root = dir.path().display()
    );
    fs::write(&path, yaml).unwrap();

    let config = load_config_file(&path).unwrap();
    assert_eq!(config.gate.denied_programs, vec!["nc".to_string()]);
    assert_eq!(config.sandbox.allowed_extensions, vec!["py", "toml"]);
    assert_eq!(config.sandbox.limits.memory_bytes, Some(268_435_456));
    assert_eq!(config.recovery.attempt_timeout_ms, 5_000);
    assert_eq!(config.ledger.capacity, 50);

    let extra = &config.recovery.extra_actions[0];
    assert_eq!(extra.kind, ActionKind::Install);
    assert!(!extra.mutates_file);

    let planner = RecoveryPlanner::with_extra_actions(&config.recovery.extra_actions).unwrap();
    let names: Vec<String> = planner
        .plan("import_error")
        .into_iter()
        .map(|action| action.name)
        .collect();
    assert_eq!(names.last().map(String::as_str), Some("uv_add"));

    let orchestrator = SafetyOrchestrator::from_config(&config).unwrap();
    assert!(orchestrator.gate().check_repair("uv add httpx").is_empty());
}

#[test]
fn json_config_round_trips_through_the_builder() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigBuilder::new()
        .project_root(dir.path())
        .cpu_limit_secs(5)
        .ledger_capacity(10)
        .build()
        .unwrap();
    let path = dir.path().join("guardrun.json");
    fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    assert_eq!(load_config_file(&path).unwrap(), config);
}

#[test]
fn malformed_files_are_config_errors() {
    let dir = tempfile::tempdir().unwrap();
    let json = dir.path().join("bad.json");
    fs::write(&json, "{ \"gate\": ").unwrap();
    assert_eq!(load_config_file(&json).unwrap_err().code, ErrorCode::Config);

    let yaml = dir.path().join("bad.yml");
    fs::write(&yaml, "ledger: [1, 2\n").unwrap();
    assert_eq!(load_config_file(&yaml).unwrap_err().code, ErrorCode::Config);

    let missing = dir.path().join("missing.json");
    assert_eq!(load_config_file(&missing).unwrap_err().code, ErrorCode::Io);
}

#[test]
fn invalid_values_are_rejected_before_construction() {
    let mut config = GuardConfig::default();
    config.ledger.capacity = 0;
    assert_eq!(validate_config(&config).unwrap_err().code, ErrorCode::Config);
    assert_eq!(
        SafetyOrchestrator::from_config(&config).unwrap_err().code,
        ErrorCode::Config
    );

    let mut config = GuardConfig::default();
    config.recovery.extra_actions.push(ExtraAction {
        fault_type: "import_error".to_string(),
        name: "edit_in_place".to_string(),
        kind: ActionKind::FileEdit,
        command: "sed -i s/a/b/ {file_path}".to_string(),
        success_criteria: Vec::new(),
        mutates_file: true,
        rollback_command: None,
    });
    assert_eq!(validate_config(&config).unwrap_err().code, ErrorCode::Config);

    let mut config = GuardConfig::default();
    config.gate.dangerous_patterns.push("(unclosed".to_string());
    assert_eq!(
        SafetyOrchestrator::from_config(&config).unwrap_err().code,
        ErrorCode::Config
    );
}
