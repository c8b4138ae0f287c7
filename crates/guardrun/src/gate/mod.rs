//! Pre-flight security policy.
//!
//! [`SecurityGate`] inspects a command, its working directory and its
//! environment before anything is spawned. Every check runs, so a refusal
//! lists every violation rather than the first one found. Recovery commands
//! additionally go through [`SecurityGate::check_repair`], which only admits
//! known repair tools.

mod patterns;

use crate::config::GatePolicy;
use crate::error::GuardResult;
use crate::model::{ExecutionContext, SecurityViolation, ViolationKind};
use crate::util::compile_safe_regex;
use patterns::{DangerousPattern, DENY_RULES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Variables that inject code into every process that loads them.
/// Compared case-insensitively.
const INJECTION_ENV_VARS: &[&str] = &["LD_PRELOAD", "LD_AUDIT", "DYLD_INSERT_LIBRARIES"];

/// Search-path variables refused when an entry points into a system binary
/// directory.
const SEARCH_PATH_ENV_VARS: &[&str] = &[
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "PYTHONPATH",
    "RUBYLIB",
    "PERL5LIB",
    "CLASSPATH",
    "NODE_PATH",
    "GEM_PATH",
];

/// Variables the sandbox sets itself.
/// `sh -c` / `eval` levels inspected before a command is refused outright.
const MAX_SHELL_NESTING: usize = 4;

const RESERVED_ENV_VARS: &[&str] = &["PATH", "HOME", "TMPDIR"];

const SYSTEM_BIN_DIRS: &[&str] = &[
    "/bin",
    "/sbin",
    "/lib",
    "/lib64",
    "/usr/bin",
    "/usr/sbin",
    "/usr/lib",
    "/usr/lib64",
    "/usr/libexec",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/System",
];

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '\n', '\r', '\0',
];

/// Built-in repair tool prefixes, matched on whole tokens.
const REPAIR_PREFIXES: &[&str] = &[
    "pip install",
    "pip3 install",
    "python -m pip install",
    "python3 -m pip install",
    "pip uninstall",
    "pip3 uninstall",
    "python -m pip uninstall",
    "python3 -m pip uninstall",
    "npm install",
    "npm uninstall",
    "yarn add",
    "yarn remove",
    "pnpm add",
    "cargo add",
    "cargo remove",
    "cargo fetch",
    "go get",
    "go mod tidy",
    "gem install",
    "chmod",
    "chown",
    "black",
    "autopep8",
    "rustfmt",
    "cargo fmt",
    "gofmt",
    "prettier",
];

/// Result of [`SecurityGate::explain`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateExplanation {
    pub allowed: bool,
    pub violations: Vec<SecurityViolation>,
}

/// Static pre-execution policy check.
#[derive(Debug)]
pub struct SecurityGate {
    policy: GatePolicy,
    allowed_roots: Vec<PathBuf>,
    denied_programs: Vec<String>,
    extra_patterns: Vec<DangerousPattern>,
    repair_prefixes: Vec<Vec<String>>,
}

impl SecurityGate {
    /// Build a gate from a policy.
    ///
    /// # Errors
    /// `E_CONFIG` if a configured dangerous pattern is too long or invalid.
    pub fn new(policy: GatePolicy) -> GuardResult<Self> {
        let extra_patterns = policy
            .dangerous_patterns
            .iter()
            .map(|source| {
                compile_safe_regex(source).map(|regex| DangerousPattern {
                    name: format!("configured pattern `{source}`"),
                    regex,
                })
            })
            .collect::<GuardResult<Vec<_>>>()?;

        let mut allowed_roots: Vec<PathBuf> = [&policy.project_root, &policy.workspace_root]
            .into_iter()
            .flatten()
            .map(|root| canonical_or_raw(root.as_path()))
            .collect();
        if policy.allow_temp_root {
            allowed_roots.push(canonical_or_raw(&std::env::temp_dir()));
        }

        let repair_prefixes = REPAIR_PREFIXES
            .iter()
            .map(|prefix| (*prefix).to_string())
            .chain(policy.repair_prefixes.iter().cloned())
            .map(|prefix| patterns::tokenize(&prefix))
            .filter(|tokens| !tokens.is_empty())
            .collect();

        Ok(Self {
            denied_programs: policy.denied_programs.clone(),
            policy,
            allowed_roots,
            extra_patterns,
            repair_prefixes,
        })
    }

    #[must_use]
    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Canonical roots a working directory must live under.
    #[must_use]
    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// Run every check. An empty result means the command is approved.
    #[must_use]
    pub fn check(&self, command: &str, context: &ExecutionContext) -> Vec<SecurityViolation> {
        let mut violations = self.check_command(command);
        violations.extend(self.check_working_directory(context.working_directory()));
        violations.extend(check_environment(context));
        if !violations.is_empty() {
            tracing::debug!(command, count = violations.len(), "gate refused command");
        }
        violations
    }

    /// Denylist and dangerous-pattern checks over the command text alone.
    #[must_use]
    pub fn check_command(&self, command: &str) -> Vec<SecurityViolation> {
        let mut violations = Vec::new();
        if command.trim().is_empty() {
            violations.push(SecurityViolation::new(
                ViolationKind::DeniedCommand,
                "empty command",
                "",
            ));
            return violations;
        }

        self.check_segments(command, 0, &mut violations);

        for pattern in patterns::builtin_patterns()
            .iter()
            .chain(self.extra_patterns.iter())
        {
            if let Some(found) = pattern.regex.find(command) {
                violations.push(SecurityViolation::new(
                    ViolationKind::DangerousPattern,
                    format!("dangerous pattern: {}", pattern.name),
                    found.as_str().trim(),
                ));
            }
        }
        violations
    }

    /// Denylist checks for every segment, descending into `sh -c` and
    /// `eval` operands.
    fn check_segments(&self, text: &str, depth: usize, violations: &mut Vec<SecurityViolation>) {
        for segment in patterns::split_segments(text) {
            let tokens = patterns::tokenize(&segment);
            let Some((program, args)) = patterns::program_and_args(&tokens) else {
                continue;
            };
            if let Some(rule) = DENY_RULES.iter().find(|rule| rule.matches(&program, &args)) {
                violations.push(SecurityViolation::new(
                    ViolationKind::DeniedCommand,
                    format!("{} is not allowed: `{segment}`", rule.reason),
                    program.clone(),
                ));
            } else if self.denied_programs.iter().any(|denied| denied == &program) {
                violations.push(SecurityViolation::new(
                    ViolationKind::DeniedCommand,
                    format!("program is denied by configuration: `{segment}`"),
                    program.clone(),
                ));
            }
            let Some(script) = patterns::inline_script(&program, &args) else {
                continue;
            };
            if depth >= MAX_SHELL_NESTING {
                violations.push(SecurityViolation::new(
                    ViolationKind::DeniedCommand,
                    "nested shell is too deep to inspect",
                    segment,
                ));
            } else {
                self.check_segments(&script, depth + 1, violations);
            }
        }
    }

    /// The working directory must resolve inside one of the allowed roots.
    #[must_use]
    pub fn check_working_directory(&self, dir: &Path) -> Vec<SecurityViolation> {
        let subject = dir.display().to_string();
        let canonical = match dir.canonicalize() {
            Ok(path) => path,
            Err(err) => {
                return vec![SecurityViolation::new(
                    ViolationKind::WorkingDirectory,
                    format!("working directory cannot be resolved: {err}"),
                    subject,
                )];
            }
        };
        if !canonical.is_dir() {
            return vec![SecurityViolation::new(
                ViolationKind::WorkingDirectory,
                "working directory is not a directory",
                subject,
            )];
        }
        if self
            .allowed_roots
            .iter()
            .any(|root| canonical.starts_with(root))
        {
            return Vec::new();
        }
        vec![SecurityViolation::new(
            ViolationKind::WorkingDirectory,
            format!(
                "working directory {} is outside the allowed roots",
                canonical.display()
            ),
            subject,
        )]
    }

    /// Recovery commands must be one command starting with a repair prefix.
    #[must_use]
    pub fn check_repair(&self, command: &str) -> Vec<SecurityViolation> {
        let segments = patterns::split_segments(command);
        if segments.len() != 1 {
            return vec![SecurityViolation::new(
                ViolationKind::RepairNotAllowed,
                "repair commands must be a single simple command",
                command,
            )];
        }
        let tokens = segments
            .first()
            .map(|segment| patterns::tokenize(segment.as_str()))
            .unwrap_or_default();
        let allowed = self.repair_prefixes.iter().any(|prefix| {
            tokens.len() >= prefix.len() && tokens.iter().zip(prefix).all(|(a, b)| a == b)
        });
        if allowed {
            Vec::new()
        } else {
            vec![SecurityViolation::new(
                ViolationKind::RepairNotAllowed,
                "command does not start with an allow-listed repair tool",
                command,
            )]
        }
    }

    /// Gate verdict for a command without running it.
    #[must_use]
    pub fn explain(&self, command: &str, context: &ExecutionContext) -> GateExplanation {
        let violations = self.check(command, context);
        GateExplanation {
            allowed: violations.is_empty(),
            violations,
        }
    }
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn check_environment(context: &ExecutionContext) -> Vec<SecurityViolation> {
    let mut violations = Vec::new();
    for (name, value) in context.environment() {
        let is = |list: &[&str]| list.iter().any(|entry| entry.eq_ignore_ascii_case(name));
        if is(RESERVED_ENV_VARS) {
            violations.push(SecurityViolation::new(
                ViolationKind::Environment,
                "variable is owned by the sandbox and cannot be overridden",
                name.clone(),
            ));
        } else if is(INJECTION_ENV_VARS) {
            violations.push(SecurityViolation::new(
                ViolationKind::Environment,
                "library injection variables are never allowed",
                name.clone(),
            ));
        } else if is(SEARCH_PATH_ENV_VARS) && points_into_system_dir(value) {
            violations.push(SecurityViolation::new(
                ViolationKind::Environment,
                "search path points into a system binary directory",
                name.clone(),
            ));
        }
        if value.contains(SHELL_METACHARACTERS) {
            violations.push(SecurityViolation::new(
                ViolationKind::Environment,
                "value contains shell metacharacters",
                name.clone(),
            ));
        }
    }
    violations
}

fn points_into_system_dir(value: &str) -> bool {
    value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(|entry| canonical_or_raw(Path::new(entry)))
        .any(|entry| SYSTEM_BIN_DIRS.iter().any(|dir| entry.starts_with(dir)))
}
