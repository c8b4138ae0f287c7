use crate::model::ExecutionContext;
use std::collections::BTreeMap;
use std::path::Path;

/// Minimal environment for a sandboxed process. Nothing is inherited from
/// the harness; caller variables have already passed the gate.
pub(crate) fn build_environment(
    context: &ExecutionContext,
    harness_dir: &Path,
    path: &str,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = context.environment().clone();
    env.insert(
        "HOME".to_string(),
        harness_dir.join("home").display().to_string(),
    );
    env.insert(
        "TMPDIR".to_string(),
        harness_dir.join("tmp").display().to_string(),
    );
    env.insert("PATH".to_string(), path.to_string());
    env.entry("LANG".to_string())
        .or_insert_with(|| "C.UTF-8".to_string());
    env
}
