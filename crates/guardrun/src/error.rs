//! Library error type.
//!
//! Every fallible operation in the crate returns [`GuardResult`]. Errors carry a
//! stable [`ErrorCode`], a human-readable message, and optional structured
//! context that callers can serialize next to a report.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Result alias used throughout the crate.
pub type GuardResult<T> = Result<T, GuardError>;

/// Stable machine-readable error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Refused by the security gate.
    #[serde(rename = "E_POLICY_DENIED")]
    PolicyDenied,
    /// Execution context failed validation.
    #[serde(rename = "E_INVALID_CONTEXT")]
    InvalidContext,
    /// Configuration could not be loaded or is out of range.
    #[serde(rename = "E_CONFIG")]
    Config,
    /// Filesystem or process I/O failed.
    #[serde(rename = "E_IO")]
    Io,
    /// A process could not be spawned.
    #[serde(rename = "E_SPAWN")]
    Spawn,
    /// A bounded wait expired.
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    /// A backup failed integrity verification.
    #[serde(rename = "E_INTEGRITY")]
    Integrity,
    /// A recovery template could not be instantiated.
    #[serde(rename = "E_TEMPLATE")]
    Template,
    /// Anything else.
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// The wire representation of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PolicyDenied => "E_POLICY_DENIED",
            Self::InvalidContext => "E_INVALID_CONTEXT",
            Self::Config => "E_CONFIG",
            Self::Io => "E_IO",
            Self::Spawn => "E_SPAWN",
            Self::Timeout => "E_TIMEOUT",
            Self::Integrity => "E_INTEGRITY",
            Self::Template => "E_TEMPLATE",
            Self::Internal => "E_INTERNAL",
        }
    }

    /// Process exit code the CLI uses when this error ends a command.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::PolicyDenied => 2,
            Self::InvalidContext | Self::Config => 3,
            Self::Timeout => crate::model::TIMEOUT_EXIT_CODE,
            Self::Io | Self::Spawn | Self::Integrity | Self::Template | Self::Internal => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable snapshot of a [`GuardError`], embedded in reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{code}: {message}")]
pub struct GuardError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

impl GuardError {
    pub fn new(code: ErrorCode, message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn policy_denied(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::PolicyDenied, message, context)
    }

    pub fn invalid_context(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::InvalidContext, message, context)
    }

    pub fn config(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Config, message, context)
    }

    pub fn timeout(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Timeout, message, context)
    }

    pub fn template(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Template, message, context)
    }

    pub fn integrity(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Integrity, message, context)
    }

    /// Wrap an underlying I/O style error, keeping its text as context.
    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn spawn(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Spawn,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, None)
    }

    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code,
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}
