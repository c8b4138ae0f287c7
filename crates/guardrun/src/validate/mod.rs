//! File validation for the file-mutation flow.
//!
//! Issues are written as `file:line: SyntaxError: message` diagnostics, the
//! same shape interpreters print, so the classifier handles them without
//! special cases.

mod python;

use crate::error::GuardResult;
use crate::model::{BackupRecord, ValidationReport};
use crate::recovery::BackupStore;
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Default ceiling for validated files.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Checks a file and snapshots it before mutation.
pub trait FileValidator: Send + Sync + Debug {
    fn validate(&self, path: &Path) -> ValidationReport;

    fn backup(&self, path: &Path) -> GuardResult<BackupRecord>;
}

/// Existence, type, size and encoding checks, plus structural checks for
/// Python sources.
#[derive(Debug, Clone)]
pub struct StructuralValidator {
    backups: Arc<BackupStore>,
    max_file_bytes: u64,
}

impl StructuralValidator {
    #[must_use]
    pub fn new(backups: Arc<BackupStore>) -> Self {
        Self {
            backups,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }
}

impl FileValidator for StructuralValidator {
    fn validate(&self, path: &Path) -> ValidationReport {
        let mut report = ValidationReport::valid();
        let display = path.display();
        let Ok(metadata) = fs::metadata(path) else {
            report.issues.push(format!("{display}: No such file or directory"));
            report.is_valid = false;
            return report;
        };
        if !metadata.is_file() {
            report.issues.push(format!("{display}: not a regular file"));
        } else if metadata.len() > self.max_file_bytes {
            report.issues.push(format!(
                "{display}: file is {} bytes, above the {} byte ceiling",
                metadata.len(),
                self.max_file_bytes
            ));
        } else {
            check_contents(path, &mut report);
        }
        report.is_valid = report.issues.is_empty();
        tracing::debug!(
            path = %path.display(),
            valid = report.is_valid,
            issues = report.issues.len(),
            "validated file"
        );
        report
    }

    fn backup(&self, path: &Path) -> GuardResult<BackupRecord> {
        self.backups.snapshot(path)
    }
}

fn check_contents(path: &Path, report: &mut ValidationReport) {
    let display = path.display();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            report.issues.push(format!("{display}: Permission denied ({err})"));
            return;
        }
    };
    let Ok(text) = String::from_utf8(bytes) else {
        report.issues.push(format!("{display}: file is not valid UTF-8"));
        return;
    };
    if !text.is_empty() && !text.ends_with('\n') {
        report.warnings.push(format!("{display}: no trailing newline"));
    }
    if text.contains("\r\n") {
        report.warnings.push(format!("{display}: CRLF line endings"));
    }
    if is_python(path) {
        report.issues.extend(
            python::python_issues(&text)
                .into_iter()
                .map(|issue| format!("{display}:{}: SyntaxError: {}", issue.line, issue.message)),
        );
    }
}

fn is_python(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("py"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(dir: &Path) -> StructuralValidator {
        StructuralValidator::new(Arc::new(BackupStore::new(Some(dir)).unwrap()))
    }

    #[test]
    fn valid_python_has_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.py");
        fs::write(&path, "def ok():\n    return 1\n").unwrap();
        let report = validator(dir.path()).validate(&path);
        assert!(report.is_valid, "{:?}", report.issues);
    }

    #[test]
    fn issues_use_interpreter_diagnostic_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.py");
        fs::write(&path, "def bad()\n    return 1\n").unwrap();
        let report = validator(dir.path()).validate(&path);
        assert!(!report.is_valid);
        assert_eq!(
            report.issues,
            vec![format!("{}:1: SyntaxError: expected ':'", path.display())]
        );
    }

    #[test]
    fn missing_and_binary_files_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let validator = validator(dir.path());
        assert!(!validator.validate(&dir.path().join("missing.py")).is_valid);
        let binary = dir.path().join("blob.txt");
        fs::write(&binary, [0xff, 0xfe, 0x00]).unwrap();
        assert!(!validator.validate(&binary).is_valid);
    }

    #[test]
    fn size_ceiling_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "0123456789\n").unwrap();
        let report = validator(dir.path()).with_max_file_bytes(4).validate(&path);
        assert!(!report.is_valid);
    }
}
