use crate::model::FaultId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    Syntax,
    Import,
    Dependency,
    Symbol,
    Type,
    Permission,
    FileSystem,
    Command,
    Timeout,
    Network,
    Resource,
    Runtime,
}

impl FaultCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Import => "import",
            Self::Dependency => "dependency",
            Self::Symbol => "symbol",
            Self::Type => "type",
            Self::Permission => "permission",
            Self::FileSystem => "file_system",
            Self::Command => "command",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Resource => "resource",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text around the diagnostic line plus the referenced source line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultContext {
    pub surrounding: Vec<String>,
    pub source_line: Option<String>,
}

/// Link to an earlier ledger entry of the same type or file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedFault {
    pub id: FaultId,
    pub fault_type: String,
    pub file_path: Option<PathBuf>,
    pub line_number: Option<u32>,
}

/// One classified diagnostic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedFault {
    pub id: FaultId,
    /// Rule name, e.g. `import_error`.
    pub fault_type: String,
    pub message: String,
    pub file_path: Option<PathBuf>,
    pub line_number: Option<u32>,
    pub severity: Severity,
    pub category: FaultCategory,
    pub confidence: f32,
    /// Line in the diagnostic text (1-based) that matched.
    pub output_line: usize,
    /// Named capture groups of the matching rule.
    pub captures: BTreeMap<String, String>,
    pub context: FaultContext,
    pub suggested_fixes: Vec<String>,
    pub related: Vec<RelatedFault>,
    pub detected_at_ms: u64,
}

/// The parts of a fault that depend only on the input text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaultFingerprint {
    pub fault_type: String,
    pub message: String,
    pub file_path: Option<PathBuf>,
    pub line_number: Option<u32>,
    pub output_line: usize,
    pub captures: BTreeMap<String, String>,
}

impl DetectedFault {
    /// Identity of the fault ignoring ids, timestamps and ledger links.
    #[must_use]
    pub fn fingerprint(&self) -> FaultFingerprint {
        FaultFingerprint {
            fault_type: self.fault_type.clone(),
            message: self.message.clone(),
            file_path: self.file_path.clone(),
            line_number: self.line_number,
            output_line: self.output_line,
            captures: self.captures.clone(),
        }
    }

    /// Key used to avoid repairing the same problem twice in one run.
    #[must_use]
    pub fn repair_key(&self) -> (String, Option<PathBuf>, Option<u32>, BTreeMap<String, String>) {
        let mut captures = self.captures.clone();
        captures.remove("message");
        (
            self.fault_type.clone(),
            self.file_path.clone(),
            self.line_number,
            captures,
        )
    }

    #[must_use]
    pub fn capture(&self, name: &str) -> Option<&str> {
        self.captures.get(name).map(String::as_str)
    }
}
