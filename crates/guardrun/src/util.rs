use crate::error::{GuardError, GuardResult};
use crate::model::MAX_REGEX_PATTERN_LEN;
use regex::{Regex, RegexBuilder};

/// Compiled program size ceiling for regexes built from configuration.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Compile a pattern with length and compiled-size ceilings.
///
/// # Errors
/// `E_CONFIG` if the pattern is too long or does not compile within limits.
pub fn compile_safe_regex(pattern: &str) -> GuardResult<Regex> {
    if pattern.len() > MAX_REGEX_PATTERN_LEN {
        return Err(GuardError::config(
            "regex pattern exceeds maximum length",
            serde_json::json!({
                "length": pattern.len(),
                "max": MAX_REGEX_PATTERN_LEN,
            }),
        ));
    }
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|err| {
            GuardError::config(
                "invalid regex pattern",
                serde_json::json!({ "pattern": pattern, "source": err.to_string() }),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_patterns_are_refused() {
        let pattern = "a".repeat(MAX_REGEX_PATTERN_LEN + 1);
        assert!(compile_safe_regex(&pattern).is_err());
    }

    #[test]
    fn invalid_patterns_are_config_errors() {
        let err = compile_safe_regex("(unclosed").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Config);
    }
}
