use crate::error::{GuardError, GuardResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wall-clock timeout for one execution.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Default per-stream capture ceiling.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Hard upper bound accepted for a single execution timeout.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Caller-supplied execution parameters.
///
/// Built through [`ExecutionContext::builder`], which validates the values.
/// Once built the context is never mutated; adjusted copies are produced with
/// the `with_*` methods.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ContextRepr")]
pub struct ExecutionContext {
    working_directory: PathBuf,
    environment: BTreeMap<String, String>,
    timeout_ms: u64,
    max_output_bytes: usize,
    write_back: bool,
}

/// Wire shape; deserialization goes through the validating builder.
#[derive(Deserialize)]
struct ContextRepr {
    working_directory: PathBuf,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    max_output_bytes: usize,
    #[serde(default)]
    write_back: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

impl TryFrom<ContextRepr> for ExecutionContext {
    type Error = GuardError;

    fn try_from(repr: ContextRepr) -> Result<Self, Self::Error> {
        ExecutionContext::builder(repr.working_directory)
            .environment(repr.environment)
            .timeout_ms(repr.timeout_ms)
            .max_output_bytes(repr.max_output_bytes)
            .write_back(repr.write_back)
            .build()
    }
}

impl ExecutionContext {
    /// Start building a context rooted at `working_directory`.
    #[must_use]
    pub fn builder(working_directory: impl Into<PathBuf>) -> ExecutionContextBuilder {
        ExecutionContextBuilder::new(working_directory)
    }

    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    #[must_use]
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    #[must_use]
    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Whether changed workspace files are copied back after the run.
    #[must_use]
    pub fn write_back(&self) -> bool {
        self.write_back
    }

    /// Copy of this context with a different timeout.
    pub fn with_timeout(&self, timeout: Duration) -> GuardResult<Self> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        validate_timeout(timeout_ms)?;
        Ok(Self {
            timeout_ms,
            ..self.clone()
        })
    }

    /// Copy of this context with write-back toggled.
    #[must_use]
    pub fn with_write_back(&self, write_back: bool) -> Self {
        Self {
            write_back,
            ..self.clone()
        }
    }

    /// Copy of this context rooted at another directory.
    #[must_use]
    pub fn with_working_directory(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: dir.into(),
            ..self.clone()
        }
    }
}

/// Fluent builder for [`ExecutionContext`].
#[derive(Clone, Debug)]
pub struct ExecutionContextBuilder {
    working_directory: PathBuf,
    environment: BTreeMap<String, String>,
    timeout_ms: u64,
    max_output_bytes: usize,
    write_back: bool,
}

impl ExecutionContextBuilder {
    #[must_use]
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            environment: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            write_back: false,
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn environment(mut self, vars: BTreeMap<String, String>) -> Self {
        self.environment = vars;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn write_back(mut self, enabled: bool) -> Self {
        self.write_back = enabled;
        self
    }

    /// Validate and build the context.
    ///
    /// # Errors
    /// `E_INVALID_CONTEXT` when the timeout is zero or above [`MAX_TIMEOUT_MS`],
    /// the output ceiling is zero, the working directory is relative, or an
    /// environment variable name is empty or contains `=`.
    pub fn build(self) -> GuardResult<ExecutionContext> {
        validate_timeout(self.timeout_ms)?;
        if self.max_output_bytes == 0 {
            return Err(GuardError::invalid_context(
                "max_output_bytes must be greater than zero",
                None,
            ));
        }
        if !self.working_directory.is_absolute() {
            return Err(GuardError::invalid_context(
                "working directory must be an absolute path",
                serde_json::json!({ "working_directory": self.working_directory }),
            ));
        }
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(GuardError::invalid_context(
                    "invalid environment variable name",
                    serde_json::json!({ "var": key }),
                ));
            }
        }
        Ok(ExecutionContext {
            working_directory: self.working_directory,
            environment: self.environment,
            timeout_ms: self.timeout_ms,
            max_output_bytes: self.max_output_bytes,
            write_back: self.write_back,
        })
    }
}

fn validate_timeout(timeout_ms: u64) -> GuardResult<()> {
    if timeout_ms == 0 || timeout_ms > MAX_TIMEOUT_MS {
        return Err(GuardError::invalid_context(
            "timeout must be between 1ms and 24h",
            serde_json::json!({ "timeout_ms": timeout_ms, "max_timeout_ms": MAX_TIMEOUT_MS }),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn builder_applies_defaults() {
        let ctx = ExecutionContext::builder("/tmp").build().unwrap();
        assert_eq!(ctx.timeout_ms(), DEFAULT_TIMEOUT_MS);
        assert_eq!(ctx.max_output_bytes(), DEFAULT_MAX_OUTPUT_BYTES);
        assert!(!ctx.write_back());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = ExecutionContext::builder("/tmp")
            .timeout_ms(0)
            .build()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidContext);
    }

    #[test]
    fn relative_working_directory_is_rejected() {
        let err = ExecutionContext::builder("relative/dir")
            .build()
            .unwrap_err();
        assert!(err.message.contains("absolute"));
    }

    #[test]
    fn env_names_with_equals_are_rejected() {
        let err = ExecutionContext::builder("/tmp")
            .env("A=B", "x")
            .build()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidContext);
    }

    #[test]
    fn deserialization_validates() {
        let err = serde_json::from_str::<ExecutionContext>(
            r#"{"working_directory": "/tmp", "timeout_ms": 0}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout"));

        let ctx: ExecutionContext =
            serde_json::from_str(r#"{"working_directory": "/tmp"}"#).unwrap();
        assert_eq!(ctx.timeout_ms(), DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn with_timeout_produces_adjusted_copy() {
        let ctx = ExecutionContext::builder("/tmp").build().unwrap();
        let longer = ctx.with_timeout(Duration::from_secs(90)).unwrap();
        assert_eq!(longer.timeout_ms(), 90_000);
        assert_eq!(ctx.timeout_ms(), DEFAULT_TIMEOUT_MS);
    }
}
