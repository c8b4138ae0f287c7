//! Pattern-based fault classification.
//!
//! [`ErrorClassifier::classify`] scans diagnostic text line by line against
//! the ordered [`rules`] table and turns every match into a
//! [`DetectedFault`]. Each call also appends the faults to the classifier's
//! [`Ledger`], which feeds [`ErrorClassifier::trends`] and
//! [`ErrorClassifier::recommendations`].

mod ledger;
mod rules;

pub use ledger::{ExecutionSummary, FaultTrends, Ledger, LedgerStatistics};
pub use rules::{rules, FaultRule};

use crate::config::LedgerConfig;
use crate::model::{now_ms, DetectedFault, FaultCategory, FaultContext, FaultId, Severity};
use regex::{Captures, Regex};
use rules::CompiledRule;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Lines of diagnostic text kept on either side of a match.
const CONTEXT_LINES: usize = 2;
/// How far back to look for a Python traceback frame.
const FRAME_LOOKBACK: usize = 12;
/// How far forward to look for a Rust `-->` pointer.
const POINTER_LOOKAHEAD: usize = 3;
/// Source files larger than this are not read for the offending line.
const MAX_SOURCE_BYTES: u64 = 1024 * 1024;

/// Ledger thresholds for [`ErrorClassifier::recommendations`].
const REPEATED_IMPORT_FAULTS: u64 = 3;
const REPEATED_SYNTAX_FAULTS: u64 = 3;
const REPEATED_TIMEOUTS: u64 = 2;
const HOT_FILE_FAULTS: u64 = 3;

/// Where the diagnostic text came from.
#[derive(Clone, Debug, Default)]
pub struct ClassifyOptions {
    /// File to attribute faults to when the text names none.
    pub file_path: Option<PathBuf>,
    /// Directory relative paths are resolved against, normally the caller's
    /// working directory.
    pub base_dir: Option<PathBuf>,
    /// Sandbox workspace the diagnostics were produced in; paths under it
    /// are remapped onto `base_dir`.
    pub workspace_dir: Option<PathBuf>,
}

/// Classifier plus the ledger it owns.
#[derive(Debug)]
pub struct ErrorClassifier {
    ledger: Ledger,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            ledger: Ledger::new(config),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Classify `text`, attributing location-less faults to `file_path`.
    pub fn classify(&self, text: &str, file_path: Option<&Path>) -> Vec<DetectedFault> {
        let options = ClassifyOptions {
            file_path: file_path.map(Path::to_path_buf),
            ..ClassifyOptions::default()
        };
        self.classify_with(text, &options)
    }

    pub fn classify_with(&self, text: &str, options: &ClassifyOptions) -> Vec<DetectedFault> {
        let lines: Vec<&str> = text.lines().collect();
        let mut faults = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if let Some((compiled, regex, captures)) = match_line(line) {
                faults.push(build_fault(
                    (compiled, regex, &captures),
                    &lines,
                    index,
                    options,
                ));
            }
        }
        self.record(&mut faults);
        tracing::debug!(
            lines = lines.len(),
            faults = faults.len(),
            "classified diagnostic text"
        );
        faults
    }

    /// Build a fault for a condition observed outside the text, such as a
    /// harness timeout. Returns `None` when `fault_type` names no rule.
    pub fn synthesize(
        &self,
        fault_type: &str,
        message: impl Into<String>,
        options: &ClassifyOptions,
    ) -> Option<DetectedFault> {
        let compiled = rules::compiled_rules()
            .iter()
            .find(|compiled| compiled.rule.name == fault_type)?;
        let message = message.into();
        let mut fault = DetectedFault {
            id: FaultId::new(),
            fault_type: compiled.rule.name.to_string(),
            message: message.clone(),
            file_path: options.file_path.clone(),
            line_number: None,
            severity: compiled.rule.severity,
            category: compiled.rule.category,
            confidence: 1.0,
            output_line: 0,
            captures: BTreeMap::from([("message".to_string(), message)]),
            context: FaultContext::default(),
            suggested_fixes: Vec::new(),
            related: Vec::new(),
            detected_at_ms: now_ms(),
        };
        fault.suggested_fixes = suggestions(compiled.rule, &fault.captures);
        let mut faults = vec![fault];
        self.record(&mut faults);
        faults.pop()
    }

    /// Link related faults, then append to the ledger.
    fn record(&self, faults: &mut [DetectedFault]) {
        for fault in faults.iter_mut() {
            fault.related = self.ledger.related_to(fault);
        }
        self.ledger.append(faults);
    }

    pub fn record_execution(&self, summary: ExecutionSummary) {
        self.ledger.record_execution(summary);
    }

    #[must_use]
    pub fn trends(&self) -> FaultTrends {
        self.ledger.trends()
    }

    #[must_use]
    pub fn statistics(&self) -> LedgerStatistics {
        self.ledger.statistics()
    }

    pub fn clear(&self) {
        self.ledger.clear();
    }

    /// Advice derived from repeated patterns in the ledger.
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let trends = self.ledger.trends();
        let category = |category: FaultCategory| {
            trends.by_category.get(&category).copied().unwrap_or_default()
        };
        let mut advice = Vec::new();
        let imports = category(FaultCategory::Import) + category(FaultCategory::Dependency);
        if imports >= REPEATED_IMPORT_FAULTS {
            advice.push(format!(
                "{imports} import faults seen: declare dependencies in a manifest \
                 (requirements.txt, package.json, Cargo.toml, go.mod)"
            ));
        }
        let syntax = category(FaultCategory::Syntax);
        if syntax >= REPEATED_SYNTAX_FAULTS {
            advice.push(format!(
                "{syntax} syntax faults seen: run a linter or formatter before executing"
            ));
        }
        let timeouts = category(FaultCategory::Timeout);
        if timeouts >= REPEATED_TIMEOUTS {
            advice.push(format!(
                "{timeouts} timeouts seen: split long-running work into smaller steps"
            ));
        }
        if let Some((path, count)) = trends.most_problematic_files.first() {
            if *count >= HOT_FILE_FAULTS {
                advice.push(format!(
                    "{} accounts for {count} faults: review it first",
                    path.display()
                ));
            }
        }
        advice
    }
}

/// Per-report advice for a set of faults.
#[must_use]
pub fn fault_recommendations(faults: &[DetectedFault]) -> Vec<String> {
    let mut advice = Vec::new();
    if faults.iter().any(|fault| fault.severity == Severity::Critical) {
        advice.push(
            "critical resource faults seen: review the memory, CPU and disk limits".to_string(),
        );
    }
    if faults
        .iter()
        .any(|fault| fault.category == FaultCategory::Timeout)
    {
        advice.push("execution timed out: split the work or raise the timeout".to_string());
    }
    advice
}

/// First rule, and the pattern within it, that matches `line`.
fn match_line<'t>(line: &'t str) -> Option<(&'static CompiledRule, &'static Regex, Captures<'t>)> {
    rules::compiled_rules().iter().find_map(|compiled| {
        compiled.regexes.iter().find_map(|regex| {
            regex
                .captures(line)
                .map(|captures| (compiled, regex, captures))
        })
    })
}

fn build_fault(
    matched: (&CompiledRule, &Regex, &Captures<'_>),
    lines: &[&str],
    index: usize,
    options: &ClassifyOptions,
) -> DetectedFault {
    let (compiled, regex, captures) = matched;
    let rule = compiled.rule;
    let mut named = named_captures(regex, captures);
    if let Some(package) = derive_package(rule.name, &named) {
        named.entry("package".to_string()).or_insert(package);
    }

    let (raw_file, line_number) = location(&named, lines, index);
    let file_path = raw_file
        .map(|raw| resolve_path(&raw, options))
        .or_else(|| options.file_path.clone());
    let line_text = lines.get(index).copied().unwrap_or_default().trim();

    let source_line = match (&file_path, line_number) {
        (Some(path), Some(line)) => read_source_line(path, line),
        _ => None,
    };
    let start = index.saturating_sub(CONTEXT_LINES);
    let end = (index + CONTEXT_LINES + 1).min(lines.len());
    let surrounding = lines
        .get(start..end)
        .unwrap_or_default()
        .iter()
        .map(|line| (*line).to_string())
        .collect();

    DetectedFault {
        id: FaultId::new(),
        fault_type: rule.name.to_string(),
        message: line_text.to_string(),
        file_path,
        line_number,
        severity: rule.severity,
        category: rule.category,
        confidence: rule.confidence,
        output_line: index + 1,
        suggested_fixes: suggestions(rule, &named),
        captures: named,
        context: FaultContext {
            surrounding,
            source_line,
        },
        related: Vec::new(),
        detected_at_ms: now_ms(),
    }
}

fn named_captures(regex: &Regex, captures: &Captures<'_>) -> BTreeMap<String, String> {
    let mut named = BTreeMap::new();
    for name in regex.capture_names().flatten() {
        if let Some(value) = captures.name(name) {
            named.insert(name.to_string(), value.as_str().to_string());
        }
    }
    named
}

fn derive_package(rule_name: &str, captures: &BTreeMap<String, String>) -> Option<String> {
    let module = captures.get("module")?;
    match rule_name {
        "import_error" => Some(rules::python_distribution(module)),
        "node_module_not_found" => rules::node_package(module),
        "unresolved_import" => rules::rust_crate(module),
        _ => None,
    }
}

fn frame_regex() -> Option<&'static Regex> {
    static FRAME: OnceLock<Option<Regex>> = OnceLock::new();
    FRAME
        .get_or_init(|| Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)"#).ok())
        .as_ref()
}

fn pointer_regex() -> Option<&'static Regex> {
    static POINTER: OnceLock<Option<Regex>> = OnceLock::new();
    POINTER
        .get_or_init(|| Regex::new(r"^\s*--> (?P<file>[^:\s]+):(?P<line>\d+)").ok())
        .as_ref()
}

/// File and line from the captures, else from a nearby traceback frame or
/// compiler pointer.
fn location(
    captures: &BTreeMap<String, String>,
    lines: &[&str],
    index: usize,
) -> (Option<String>, Option<u32>) {
    let line = captures.get("line").and_then(|line| line.parse().ok());
    if let Some(file) = captures.get("file") {
        return (Some(file.clone()), line);
    }
    let start = index.saturating_sub(FRAME_LOOKBACK);
    let before = lines.get(start..index).unwrap_or_default();
    let frame = frame_regex().and_then(|regex| {
        before.iter().rev().find_map(|text| {
            let caps = regex.captures(text)?;
            let file = caps.name("file")?.as_str();
            if file.starts_with('<') {
                return None;
            }
            let frame_line = caps.name("line").and_then(|m| m.as_str().parse().ok());
            Some((file.to_string(), frame_line))
        })
    });
    if let Some((file, frame_line)) = frame {
        return (Some(file), frame_line.or(line));
    }
    let end = (index + 1 + POINTER_LOOKAHEAD).min(lines.len());
    let after = lines.get(index + 1..end).unwrap_or_default();
    let pointer = pointer_regex().and_then(|regex| {
        after.iter().find_map(|text| {
            let caps = regex.captures(text)?;
            Some((
                caps.name("file")?.as_str().to_string(),
                caps.name("line").and_then(|m| m.as_str().parse().ok()),
            ))
        })
    });
    match pointer {
        Some((file, pointer_line)) => (Some(file), pointer_line.or(line)),
        None => (None, line),
    }
}

/// Map sandbox workspace paths back onto the caller's tree and resolve
/// relative paths against the base directory.
fn resolve_path(raw: &str, options: &ClassifyOptions) -> PathBuf {
    let path = PathBuf::from(raw);
    if let (Some(workspace), Some(base)) = (&options.workspace_dir, &options.base_dir) {
        if let Ok(relative) = path.strip_prefix(workspace) {
            return base.join(relative);
        }
    }
    match &options.base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

fn read_source_line(path: &Path, line: u32) -> Option<String> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() || metadata.len() > MAX_SOURCE_BYTES {
        return None;
    }
    let index = usize::try_from(line.checked_sub(1)?).ok()?;
    let text = fs::read_to_string(path).ok()?;
    text.lines().nth(index).map(str::to_string)
}

fn render_hint(hint: &str, captures: &BTreeMap<String, String>) -> Option<String> {
    let mut rendered = String::with_capacity(hint.len());
    let mut rest = hint;
    while let Some(open) = rest.find('{') {
        let (head, tail) = rest.split_at(open);
        rendered.push_str(head);
        let close = tail.find('}')?;
        let name = tail.get(1..close)?;
        rendered.push_str(captures.get(name)?);
        rest = tail.get(close + 1..)?;
    }
    rendered.push_str(rest);
    Some(rendered)
}

fn suggestions(rule: &FaultRule, captures: &BTreeMap<String, String>) -> Vec<String> {
    let mut fixes: Vec<String> = rule
        .fix_hint
        .and_then(|hint| render_hint(hint, captures))
        .into_iter()
        .collect();
    fixes.extend(
        generic_suggestions(rule.category)
            .iter()
            .map(|fix| (*fix).to_string()),
    );
    fixes
}

fn generic_suggestions(category: FaultCategory) -> &'static [&'static str] {
    match category {
        FaultCategory::Import => &[
            "Install the missing package with the project's package manager",
            "Verify the module path and spelling",
        ],
        FaultCategory::Dependency => &[
            "Check the package name and version constraint",
            "Verify the package registry is reachable",
        ],
        FaultCategory::Syntax => &[
            "Check for unbalanced brackets or quotes",
            "Check for a missing colon after a block header",
            "Check that indentation is consistent",
        ],
        FaultCategory::Symbol => &[
            "Check the spelling of the name",
            "Import or define the name before it is used",
        ],
        FaultCategory::Type => &["Check argument types and counts at the call site"],
        FaultCategory::Permission => &["Check file ownership and permission bits"],
        FaultCategory::FileSystem => &["Verify the path relative to the working directory"],
        FaultCategory::Command => &["Install the program or add its directory to PATH"],
        FaultCategory::Timeout => &["Raise the timeout or reduce the work done per run"],
        FaultCategory::Network => &["Check network access from the sandbox"],
        FaultCategory::Resource => &["Reduce resource usage or raise the configured limits"],
        FaultCategory::Runtime => &["Inspect the full output for the failing frame"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::default()
    }

    #[test]
    fn python_import_error_binds_module_and_package() {
        let text = "Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\nModuleNotFoundError: No module named 'cv2'\n";
        let faults = classifier().classify(text, None);
        assert_eq!(faults.len(), 1);
        let fault = faults.first().unwrap();
        assert_eq!(fault.fault_type, "import_error");
        assert_eq!(fault.capture("module"), Some("cv2"));
        assert_eq!(fault.capture("package"), Some("opencv-python"));
        assert_eq!(fault.output_line, 3);
        assert_eq!(fault.file_path, None);
        assert_eq!(
            fault.suggested_fixes.first().map(String::as_str),
            Some("Install the missing module: pip install opencv-python")
        );
    }

    #[test]
    fn traceback_frame_supplies_location() {
        let text = "  File \"/ws/app/main.py\", line 4\n    def run()\n             ^\nSyntaxError: expected ':'\n";
        let options = ClassifyOptions {
            base_dir: Some(PathBuf::from("/home/me/app")),
            workspace_dir: Some(PathBuf::from("/ws/app")),
            ..ClassifyOptions::default()
        };
        let faults = classifier().classify_with(text, &options);
        let fault = faults.first().unwrap();
        assert_eq!(fault.fault_type, "syntax_error");
        assert_eq!(fault.file_path, Some(PathBuf::from("/home/me/app/main.py")));
        assert_eq!(fault.line_number, Some(4));
        assert_eq!(fault.capture("message"), Some("expected ':'"));
    }

    #[test]
    fn rust_pointer_supplies_location() {
        let text = "error[E0432]: unresolved import `serde_json::Value`\n --> src/lib.rs:3:5\n";
        let options = ClassifyOptions {
            base_dir: Some(PathBuf::from("/proj")),
            ..ClassifyOptions::default()
        };
        let faults = classifier().classify_with(text, &options);
        let fault = faults.first().unwrap();
        assert_eq!(fault.fault_type, "unresolved_import");
        assert_eq!(fault.capture("package"), Some("serde_json"));
        assert_eq!(fault.file_path, Some(PathBuf::from("/proj/src/lib.rs")));
        assert_eq!(fault.line_number, Some(3));
    }

    #[test]
    fn first_matching_rule_wins_per_line() {
        let faults = classifier().classify("sh: 1: frobnicate: not found\n", None);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults.first().map(|f| f.fault_type.as_str()), Some("command_not_found"));
        assert_eq!(faults.first().and_then(|f| f.capture("command")), Some("frobnicate"));
    }

    #[test]
    fn fingerprints_are_deterministic() {
        let text = "main.c:10:5: error: expected ';' before '}' token\nTypeError: bad operand\n";
        let classifier = classifier();
        let first: Vec<_> = classifier.classify(text, None).iter().map(DetectedFault::fingerprint).collect();
        let second: Vec<_> = classifier.classify(text, None).iter().map(DetectedFault::fingerprint).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn repeated_faults_link_and_recommend() {
        let classifier = classifier();
        for _ in 0..3 {
            classifier.classify("ModuleNotFoundError: No module named 'requests'", None);
        }
        let faults = classifier.classify("ModuleNotFoundError: No module named 'requests'", None);
        assert_eq!(faults.first().map(|f| f.related.len()), Some(3));
        assert_eq!(classifier.trends().total_faults, 4);
        assert!(classifier
            .recommendations()
            .iter()
            .any(|advice| advice.contains("manifest")));
        classifier.clear();
        assert!(classifier.recommendations().is_empty());
    }

    #[test]
    fn source_line_is_read_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.py");
        fs::write(&path, "x = 1\ny = (\n").unwrap();
        let text = format!("{}:2: SyntaxError: '(' was never closed", path.display());
        let faults = classifier().classify(&text, None);
        let fault = faults.first().unwrap();
        assert_eq!(fault.context.source_line.as_deref(), Some("y = ("));
    }

    #[test]
    fn synthesized_timeout_uses_rule_metadata() {
        let fault = classifier()
            .synthesize("timeout", "killed after 1000ms", &ClassifyOptions::default())
            .unwrap();
        assert_eq!(fault.category, FaultCategory::Timeout);
        assert!(!fault.suggested_fixes.is_empty());
    }

    #[test]
    fn hints_with_missing_captures_are_dropped() {
        let captures = BTreeMap::new();
        assert_eq!(render_hint("pip install {package}", &captures), None);
        let captures = BTreeMap::from([("package".to_string(), "x".to_string())]);
        assert_eq!(render_hint("pip install {package}", &captures).as_deref(), Some("pip install x"));
    }
}
