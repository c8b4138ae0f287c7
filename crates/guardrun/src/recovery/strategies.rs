//! Built-in recovery strategies, per fault type, most specific first.

use super::edit::{ConfigOp, EditOp};
use crate::model::ActionKind;

#[derive(Debug, Clone, Copy)]
pub(crate) enum OpDef {
    Command(&'static str),
    Edit(EditOp),
    Config(ConfigOp),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum UndoDef {
    None,
    RestoreBackup,
    Command(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ActionDef {
    pub name: &'static str,
    pub kind: ActionKind,
    pub op: OpDef,
    pub success_criteria: &'static [&'static str],
    pub confidence: f32,
    pub mutates_file: bool,
    pub undo: UndoDef,
}

fn install(
    name: &'static str,
    template: &'static str,
    success_criteria: &'static [&'static str],
    undo: &'static str,
    confidence: f32,
) -> ActionDef {
    ActionDef {
        name,
        kind: ActionKind::Install,
        op: OpDef::Command(template),
        success_criteria,
        confidence,
        mutates_file: false,
        undo: if undo.is_empty() {
            UndoDef::None
        } else {
            UndoDef::Command(undo)
        },
    }
}

fn edit(name: &'static str, op: EditOp, confidence: f32) -> ActionDef {
    ActionDef {
        name,
        kind: ActionKind::FileEdit,
        op: OpDef::Edit(op),
        success_criteria: &[],
        confidence,
        mutates_file: op.touches_file(),
        undo: UndoDef::RestoreBackup,
    }
}

fn command(
    name: &'static str,
    template: &'static str,
    mutates_file: bool,
    confidence: f32,
) -> ActionDef {
    ActionDef {
        name,
        kind: ActionKind::Command,
        op: OpDef::Command(template),
        success_criteria: &[],
        confidence,
        mutates_file,
        undo: if mutates_file {
            UndoDef::RestoreBackup
        } else {
            UndoDef::None
        },
    }
}

/// Fault types with a built-in strategy.
pub(crate) const PLANNED_FAULT_TYPES: &[&str] = &[
    "import_error",
    "node_module_not_found",
    "unresolved_import",
    "go_missing_package",
    "syntax_error",
    "indentation_error",
    "permission_denied",
    "file_not_found",
    "command_not_found",
    "timeout",
];

pub(crate) fn strategy_for(fault_type: &str) -> Vec<ActionDef> {
    match fault_type {
        "import_error" => vec![
            install(
                "pip_install",
                "pip install {package_name}",
                &["successfully installed"],
                "pip uninstall -y {package_name}",
                0.8,
            ),
            install(
                "python_module_pip_install",
                "python3 -m pip install {package_name}",
                &["successfully installed"],
                "python3 -m pip uninstall -y {package_name}",
                0.7,
            ),
        ],
        "node_module_not_found" => vec![
            install(
                "npm_install",
                "npm install {package_name}",
                &[],
                "npm uninstall {package_name}",
                0.8,
            ),
            install(
                "yarn_add",
                "yarn add {package_name}",
                &[],
                "yarn remove {package_name}",
                0.6,
            ),
        ],
        "unresolved_import" => vec![
            install(
                "cargo_add",
                "cargo add {package_name}",
                &[],
                "cargo remove {package_name}",
                0.7,
            ),
            command("cargo_fetch", "cargo fetch", false, 0.4),
        ],
        "go_missing_package" => vec![
            install("go_get", "go get {package_name}", &[], "", 0.8),
            command("go_mod_tidy", "go mod tidy", false, 0.6),
        ],
        "syntax_error" => vec![
            edit("insert_missing_colon", EditOp::InsertMissingColon, 0.7),
            edit("close_unbalanced_bracket", EditOp::CloseUnbalancedBracket, 0.5),
        ],
        "indentation_error" => vec![
            edit("expand_tabs", EditOp::ExpandTabs, 0.7),
            command("autopep8", "autopep8 --in-place {file_path}", true, 0.5),
        ],
        "permission_denied" => vec![
            edit("grant_owner_read_write", EditOp::GrantOwnerReadWrite, 0.7),
            command("chmod_owner_read_write", "chmod u+rw {file_path}", true, 0.6),
        ],
        "file_not_found" => vec![edit(
            "create_missing_parent",
            EditOp::CreateMissingParent,
            0.4,
        )],
        "command_not_found" => vec![install(
            "pip_install_command",
            "pip install {command_name}",
            &["successfully installed"],
            "pip uninstall -y {command_name}",
            0.3,
        )],
        "timeout" => vec![ActionDef {
            name: "extend_timeout",
            kind: ActionKind::Config,
            op: OpDef::Config(ConfigOp::ExtendTimeout { factor: 2 }),
            success_criteria: &[],
            confidence: 0.6,
            mutates_file: false,
            undo: UndoDef::None,
        }],
        _ => Vec::new(),
    }
}
