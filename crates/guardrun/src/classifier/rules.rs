//! Ordered fault rule table.
//!
//! Rules are tried in table order on every line; the first rule with a
//! matching pattern wins. More specific rules therefore come first and the
//! generic compiler diagnostics come last.

use crate::model::{FaultCategory, Severity};
use regex::Regex;
use std::sync::OnceLock;

/// One classification rule.
#[derive(Debug, Clone, Copy)]
pub struct FaultRule {
    /// Fault type emitted on a match.
    pub name: &'static str,
    /// Alternative patterns, tried in order. Named groups become captures.
    pub patterns: &'static [&'static str],
    pub severity: Severity,
    pub category: FaultCategory,
    pub description: &'static str,
    /// Fix hint with `{capture}` placeholders.
    pub fix_hint: Option<&'static str>,
    pub confidence: f32,
}

pub(crate) const RULES: &[FaultRule] = &[
    FaultRule {
        name: "import_error",
        patterns: &[r"(?:ModuleNotFoundError|ImportError): No module named '?(?P<module>[\w.]+)'?"],
        severity: Severity::High,
        category: FaultCategory::Import,
        description: "Python module is not installed",
        fix_hint: Some("Install the missing module: pip install {package}"),
        confidence: 0.95,
    },
    FaultRule {
        name: "import_symbol_error",
        patterns: &[r"ImportError: cannot import name '(?P<symbol>\w+)' from '(?P<module>[\w.]+)'"],
        severity: Severity::Medium,
        category: FaultCategory::Import,
        description: "Python module does not export the requested name",
        fix_hint: Some("Check that {module} provides {symbol} in the installed version"),
        confidence: 0.85,
    },
    FaultRule {
        name: "node_module_not_found",
        patterns: &[
            r"Error: Cannot find module '(?P<module>[^']+)'",
            r"Cannot find package '(?P<module>[^']+)' imported from",
        ],
        severity: Severity::High,
        category: FaultCategory::Import,
        description: "Node module cannot be resolved",
        fix_hint: Some("Install the missing package: npm install {package}"),
        confidence: 0.9,
    },
    FaultRule {
        name: "unresolved_import",
        patterns: &[
            r"error\[E0432\]: unresolved import `(?P<module>[\w:]+)`",
            r"error\[E0433\]: failed to resolve: use of (?:undeclared crate or module|unresolved module or unlinked crate) `(?P<module>\w+)`",
            r"error\[E0463\]: can't find crate for `(?P<module>\w+)`",
        ],
        severity: Severity::High,
        category: FaultCategory::Import,
        description: "Rust import cannot be resolved",
        fix_hint: Some("Add the crate to Cargo.toml: cargo add {package}"),
        confidence: 0.85,
    },
    FaultRule {
        name: "go_missing_package",
        patterns: &[
            r"no required module provides package (?P<package>[\w./-]+)",
            r#"cannot find package "(?P<package>[^"]+)""#,
        ],
        severity: Severity::High,
        category: FaultCategory::Dependency,
        description: "Go package is not in the module graph",
        fix_hint: Some("Fetch the package: go get {package}"),
        confidence: 0.9,
    },
    FaultRule {
        name: "missing_dependency",
        patterns: &[
            r"Could not find a version that satisfies the requirement (?P<package>[^\s(]+)",
            r"No matching distribution found for (?P<package>\S+)",
            r"npm ERR! 404 Not Found - GET https?://\S+/(?P<package>[^/\s]+)\s*$",
            r"npm ERR! 404 +'(?P<package>[^@']+)@?[^']*' is not in (?:the npm|this) registry",
        ],
        severity: Severity::High,
        category: FaultCategory::Dependency,
        description: "Package is not available from the registry",
        fix_hint: Some("Check the package name {package} and the registry configuration"),
        confidence: 0.85,
    },
    FaultRule {
        name: "indentation_error",
        patterns: &[
            r"^(?:(?P<file>[^\s:][^:]*):(?P<line>\d+): )?(?:IndentationError|TabError): (?P<message>.+)",
        ],
        severity: Severity::Medium,
        category: FaultCategory::Syntax,
        description: "Inconsistent indentation",
        fix_hint: Some("Use spaces consistently for indentation"),
        confidence: 0.95,
    },
    FaultRule {
        name: "syntax_error",
        patterns: &[r"^(?:(?P<file>[^\s:][^:]*):(?P<line>\d+): )?SyntaxError: (?P<message>.+)"],
        severity: Severity::High,
        category: FaultCategory::Syntax,
        description: "Source does not parse",
        fix_hint: Some("Fix the syntax near the reported line: {message}"),
        confidence: 0.9,
    },
    FaultRule {
        name: "undefined_name",
        patterns: &[
            r"NameError: name '(?P<symbol>\w+)' is not defined",
            r"ReferenceError: (?P<symbol>[\w$]+) is not defined",
            r"error\[E0425\]: cannot find (?:value|function) `(?P<symbol>\w+)` in this scope",
            r"undefined: (?P<symbol>\w+)$",
        ],
        severity: Severity::Medium,
        category: FaultCategory::Symbol,
        description: "Name is used before it is defined",
        fix_hint: Some("Define or import {symbol} before use"),
        confidence: 0.9,
    },
    FaultRule {
        name: "type_error",
        patterns: &[
            r"TypeError: (?P<message>.+)",
            r"error\[E0308\]: (?P<message>mismatched types.*)",
        ],
        severity: Severity::Medium,
        category: FaultCategory::Type,
        description: "Value has the wrong type",
        fix_hint: None,
        confidence: 0.8,
    },
    FaultRule {
        name: "attribute_error",
        patterns: &[r"AttributeError: (?P<message>.+)"],
        severity: Severity::Medium,
        category: FaultCategory::Symbol,
        description: "Object has no such attribute",
        fix_hint: None,
        confidence: 0.85,
    },
    FaultRule {
        name: "command_not_found",
        patterns: &[
            r"^(?:\S*/)?(?:sh|bash|zsh|dash)(?:: line \d+)?(?:: \d+)?: (?P<command>[^\s:]+): (?:command )?not found",
            r"command not found: (?P<command>\S+)",
        ],
        severity: Severity::High,
        category: FaultCategory::Command,
        description: "Program is not on PATH",
        fix_hint: Some("Install {command} or adjust the sandbox PATH"),
        confidence: 0.9,
    },
    FaultRule {
        name: "permission_denied",
        patterns: &[
            r"PermissionError: \[Errno 13\] Permission denied: '(?P<file>[^']+)'",
            r"EACCES: permission denied, \w+ '(?P<file>[^']+)'",
            r"^(?:\S*/)?(?:sh|bash|zsh|dash)(?:: line \d+)?(?:: \d+)?: (?P<file>[^\s:]+): Permission denied",
            r"(?P<file>/[^\s:']+): Permission denied",
            r"(?i)permission denied",
        ],
        severity: Severity::High,
        category: FaultCategory::Permission,
        description: "Access to a file was refused",
        fix_hint: Some("Check ownership and mode of the file"),
        confidence: 0.85,
    },
    FaultRule {
        name: "file_not_found",
        patterns: &[
            r"FileNotFoundError: \[Errno 2\] No such file or directory: '(?P<file>[^']+)'",
            r"ENOENT: no such file or directory, \w+ '(?P<file>[^']+)'",
            r"can't open file '(?P<file>[^']+)'",
            r"(?P<file>/[^\s:']+): No such file or directory",
        ],
        severity: Severity::Medium,
        category: FaultCategory::FileSystem,
        description: "Referenced file does not exist",
        fix_hint: Some("Create the file or correct the path"),
        confidence: 0.85,
    },
    FaultRule {
        name: "timeout",
        patterns: &[r"(?i)\b(?:timed out|timeout expired|TimeoutError|deadline exceeded)\b"],
        severity: Severity::Medium,
        category: FaultCategory::Timeout,
        description: "Operation ran out of time",
        fix_hint: Some("Allow more time or split the work into smaller steps"),
        confidence: 0.8,
    },
    FaultRule {
        name: "network_error",
        patterns: &[
            r"(?i)(?:connection refused|could not resolve host|name or service not known|temporary failure in name resolution|network is unreachable)",
            r"\b(?:ECONNREFUSED|ENOTFOUND|ECONNRESET|EAI_AGAIN)\b",
        ],
        severity: Severity::Medium,
        category: FaultCategory::Network,
        description: "Network access failed",
        fix_hint: Some("Check connectivity or use an offline mirror"),
        confidence: 0.8,
    },
    FaultRule {
        name: "memory_error",
        patterns: &[
            r"\bMemoryError\b",
            r"JavaScript heap out of memory",
            r"memory allocation of \d+ bytes failed",
            r"(?i)\b(?:out of memory|cannot allocate memory)\b",
        ],
        severity: Severity::Critical,
        category: FaultCategory::Resource,
        description: "Process ran out of memory",
        fix_hint: Some("Reduce memory use or raise the memory limit"),
        confidence: 0.9,
    },
    FaultRule {
        name: "resource_limit",
        patterns: &[r"(?i)\bcpu time limit exceeded\b", r"(?i)\bfile size limit exceeded\b"],
        severity: Severity::Critical,
        category: FaultCategory::Resource,
        description: "Process was killed at an OS resource limit",
        fix_hint: Some("Reduce the work done per run or raise the configured limit"),
        confidence: 0.9,
    },
    FaultRule {
        name: "disk_full",
        patterns: &[r"(?i)no space left on device", r"\bENOSPC\b", r"(?i)disk quota exceeded"],
        severity: Severity::Critical,
        category: FaultCategory::Resource,
        description: "Filesystem is full",
        fix_hint: Some("Free disk space in the working directory"),
        confidence: 0.95,
    },
    FaultRule {
        name: "compile_error",
        patterns: &[
            r"^(?P<file>[^\s:(]+)\((?P<line>\d+),\d+\): error TS\d+: (?P<message>.+)",
            r"^(?P<file>[^\s:]+):(?P<line>\d+):(?:\d+:)? (?:fatal )?error: (?P<message>.+)",
            r"^(?P<file>[^\s:]+\.go):(?P<line>\d+):\d+: (?P<message>.+)",
            r"^error(?:\[E\d+\])?: (?P<message>.+)",
        ],
        severity: Severity::High,
        category: FaultCategory::Syntax,
        description: "Compiler reported an error",
        fix_hint: Some("Fix the compiler error: {message}"),
        confidence: 0.7,
    },
];

/// A rule with its patterns compiled.
#[derive(Debug)]
pub(crate) struct CompiledRule {
    pub rule: &'static FaultRule,
    pub regexes: Vec<Regex>,
}

/// The rule table, compiled once per process.
pub(crate) fn compiled_rules() -> &'static [CompiledRule] {
    static COMPILED: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .map(|rule| CompiledRule {
                rule,
                regexes: rule
                    .patterns
                    .iter()
                    .filter_map(|pattern| match Regex::new(pattern) {
                        Ok(regex) => Some(regex),
                        Err(err) => {
                            tracing::error!(rule = rule.name, %err, "fault rule failed to compile");
                            None
                        }
                    })
                    .collect(),
            })
            .collect()
    })
}

/// The static rule table.
#[must_use]
pub fn rules() -> &'static [FaultRule] {
    RULES
}

/// Python import names whose distribution has a different name.
const PYTHON_DISTRIBUTIONS: &[(&str, &str)] = &[
    ("cv2", "opencv-python"),
    ("yaml", "pyyaml"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("jwt", "pyjwt"),
    ("Crypto", "pycryptodome"),
];

/// Installable distribution for a Python module path.
pub(crate) fn python_distribution(module: &str) -> String {
    let top = module.split('.').next().unwrap_or(module);
    PYTHON_DISTRIBUTIONS
        .iter()
        .find(|(import, _)| *import == top)
        .map_or_else(|| top.to_string(), |(_, dist)| (*dist).to_string())
}

/// npm package for a module specifier; `None` for relative or absolute paths.
pub(crate) fn node_package(module: &str) -> Option<String> {
    if module.starts_with('.') || module.starts_with('/') || module.starts_with("node:") {
        return None;
    }
    let mut parts = module.split('/');
    let first = parts.next()?;
    if first.starts_with('@') {
        let second = parts.next()?;
        Some(format!("{first}/{second}"))
    } else {
        Some(first.to_string())
    }
}

/// Crate for a Rust path; `None` for paths into the current crate or std.
pub(crate) fn rust_crate(module: &str) -> Option<String> {
    let first = module.split("::").next()?;
    if matches!(first, "crate" | "self" | "super" | "std" | "core" | "alloc" | "") {
        None
    } else {
        Some(first.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pattern_compiles() {
        for compiled in compiled_rules() {
            assert_eq!(
                compiled.regexes.len(),
                compiled.rule.patterns.len(),
                "rule {} has a pattern that does not compile",
                compiled.rule.name
            );
        }
    }

    #[test]
    fn rule_names_are_unique() {
        let mut names: Vec<_> = RULES.iter().map(|rule| rule.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), RULES.len());
    }

    #[test]
    fn python_aliases_map_to_distributions() {
        assert_eq!(python_distribution("cv2"), "opencv-python");
        assert_eq!(python_distribution("yaml.loader"), "pyyaml");
        assert_eq!(python_distribution("requests"), "requests");
    }

    #[test]
    fn node_packages_handle_scopes_and_paths() {
        assert_eq!(node_package("lodash/fp").as_deref(), Some("lodash"));
        assert_eq!(node_package("@scope/pkg/sub").as_deref(), Some("@scope/pkg"));
        assert_eq!(node_package("./local"), None);
    }

    #[test]
    fn rust_crate_skips_local_paths() {
        assert_eq!(rust_crate("serde_json::Value").as_deref(), Some("serde_json"));
        assert_eq!(rust_crate("crate::model"), None);
    }
}
