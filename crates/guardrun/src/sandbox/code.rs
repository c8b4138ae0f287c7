use super::SandboxRuntime;
use crate::error::{GuardError, GuardResult};
use crate::model::{ExecutionContext, ExecutionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

/// Interpreter used for inline code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpreter {
    Python,
    Node,
    Shell,
    Ruby,
}

impl Interpreter {
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::Node => "node",
            Self::Shell => "sh",
            Self::Ruby => "ruby",
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Node => "js",
            Self::Shell => "sh",
            Self::Ruby => "rb",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Shell => "shell",
            Self::Ruby => "ruby",
        }
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interpreter {
    type Err = GuardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "node" | "nodejs" | "javascript" | "js" => Ok(Self::Node),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            "ruby" | "rb" => Ok(Self::Ruby),
            other => Err(GuardError::invalid_context(
                format!("unknown interpreter `{other}`"),
                serde_json::json!({ "supported": ["python", "node", "shell", "ruby"] }),
            )),
        }
    }
}

/// Inline source written to a scratch file. The scratch directory is
/// removed when this value is dropped.
#[derive(Debug)]
pub struct PreparedCode {
    _dir: TempDir,
    path: PathBuf,
    interpreter: Interpreter,
}

impl PreparedCode {
    /// Scratch source file; repairs edit it in place.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn interpreter(&self) -> Interpreter {
        self.interpreter
    }

    /// Shell command that runs the scratch file.
    #[must_use]
    pub fn command(&self) -> String {
        format!(
            "{} {}",
            self.interpreter.program(),
            shell_words::quote(&self.path.to_string_lossy())
        )
    }

    pub fn source(&self) -> GuardResult<String> {
        fs::read_to_string(&self.path)
            .map_err(|err| GuardError::io("failed to read scratch source", err))
    }
}

/// A [`SandboxRuntime`] wired to one interpreter.
#[derive(Debug, Clone)]
pub struct CodeRunner {
    runtime: Arc<SandboxRuntime>,
    interpreter: Interpreter,
}

impl CodeRunner {
    #[must_use]
    pub fn new(runtime: Arc<SandboxRuntime>, interpreter: Interpreter) -> Self {
        Self {
            runtime,
            interpreter,
        }
    }

    #[must_use]
    pub fn interpreter(&self) -> Interpreter {
        self.interpreter
    }

    /// Write `source` to a fresh scratch file under the temp root.
    pub fn prepare(&self, source: &str) -> GuardResult<PreparedCode> {
        let dir = tempfile::Builder::new()
            .prefix("guardrun-code-")
            .tempdir()
            .map_err(|err| GuardError::io("failed to create scratch directory", err))?;
        let path = dir.path().join(format!("main.{}", self.interpreter.extension()));
        fs::write(&path, source)
            .map_err(|err| GuardError::io("failed to write scratch source", err))?;
        Ok(PreparedCode {
            _dir: dir,
            path,
            interpreter: self.interpreter,
        })
    }

    /// Prepare and run `source` in one step.
    #[must_use]
    pub fn run(&self, source: &str, context: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        match self.prepare(source) {
            Ok(prepared) => self.run_prepared(&prepared, context),
            Err(err) => {
                let subject = format!("{} <inline>", self.interpreter.program());
                ExecutionResult::spawn_failed(subject, err.to_string(), started.elapsed())
            }
        }
    }

    /// Run an already prepared scratch file. Shell sources are gated like
    /// commands, line by line.
    #[must_use]
    pub fn run_prepared(&self, prepared: &PreparedCode, context: &ExecutionContext) -> ExecutionResult {
        let command = prepared.command();
        if prepared.interpreter == Interpreter::Shell {
            let source = match prepared.source() {
                Ok(source) => source,
                Err(err) => {
                    return ExecutionResult::spawn_failed(
                        command,
                        err.to_string(),
                        std::time::Duration::ZERO,
                    )
                }
            };
            let violations = self.runtime.gate().check_command(&source);
            if !violations.is_empty() {
                tracing::warn!(violations = violations.len(), "inline shell source refused");
                return ExecutionResult::rejected(command, violations);
            }
        }
        self.runtime.run(&command, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_names_parse() {
        assert_eq!("Python3".parse::<Interpreter>().unwrap(), Interpreter::Python);
        assert_eq!("bash".parse::<Interpreter>().unwrap(), Interpreter::Shell);
        assert!("cobol".parse::<Interpreter>().is_err());
    }
}
