//! In-process repairs: file edits and execution-setting adjustments.
//!
//! Edits are deliberately narrow. Each one either applies to the file and
//! returns a description of what changed, or reports that it does not apply
//! and leaves the file untouched.

use crate::error::{GuardError, GuardResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Python statements that open an indented block.
const BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
    "async",
];

/// Spaces substituted for one leading tab.
const TAB_WIDTH: usize = 4;

/// A file edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    /// Append `:` to the block header at (or just above) the fault line.
    InsertMissingColon,
    /// Append closers for brackets left open on the fault line.
    CloseUnbalancedBracket,
    /// Replace leading tabs with spaces.
    ExpandTabs,
    /// Add owner read and write permission bits.
    GrantOwnerReadWrite,
    /// Create the missing parent directories of the path.
    CreateMissingParent,
}

impl EditOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsertMissingColon => "insert_missing_colon",
            Self::CloseUnbalancedBracket => "close_unbalanced_bracket",
            Self::ExpandTabs => "expand_tabs",
            Self::GrantOwnerReadWrite => "grant_owner_read_write",
            Self::CreateMissingParent => "create_missing_parent",
        }
    }

    /// Whether the edit rewrites the file's bytes or mode.
    #[must_use]
    pub const fn touches_file(self) -> bool {
        !matches!(self, Self::CreateMissingParent)
    }

    /// Apply the edit. `Ok(None)` means it does not apply to this file.
    ///
    /// # Errors
    /// `E_IO` when the file cannot be read or written.
    pub fn apply(self, path: &Path, line: Option<u32>) -> GuardResult<Option<String>> {
        match self {
            Self::InsertMissingColon => rewrite(path, |text| insert_missing_colon(text, line?)),
            Self::CloseUnbalancedBracket => {
                rewrite(path, |text| close_unbalanced_brackets(text, line))
            }
            Self::ExpandTabs => rewrite(path, expand_tabs),
            Self::GrantOwnerReadWrite => grant_owner_read_write(path),
            Self::CreateMissingParent => create_missing_parent(path),
        }
    }
}

/// An adjustment to the execution settings used for the retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOp {
    /// Multiply the timeout, capped at the configured maximum.
    ExtendTimeout { factor: u32 },
}

impl ConfigOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtendTimeout { .. } => "extend_timeout",
        }
    }

    /// New timeout, or `None` when the cap leaves no room to grow.
    #[must_use]
    pub fn adjusted_timeout_ms(self, current_ms: u64, max_ms: u64) -> Option<u64> {
        match self {
            Self::ExtendTimeout { factor } => {
                let extended = current_ms.saturating_mul(u64::from(factor)).min(max_ms);
                (extended > current_ms).then_some(extended)
            }
        }
    }
}

/// Read, transform, and write back only when the transform applied.
fn rewrite(
    path: &Path,
    transform: impl FnOnce(&str) -> Option<(String, String)>,
) -> GuardResult<Option<String>> {
    let text = fs::read_to_string(path)
        .map_err(|err| GuardError::io("failed to read file for edit", err))?;
    let Some((edited, description)) = transform(&text) else {
        return Ok(None);
    };
    fs::write(path, edited).map_err(|err| GuardError::io("failed to write edited file", err))?;
    Ok(Some(description))
}

/// Split a line into code and trailing `#` comment, ignoring `#` inside
/// quotes.
fn split_comment(line: &str) -> (&str, &str) {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (index, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (Some(_), '\\') => escaped = true,
            (Some(open), c) if c == open => quote = None,
            (None, '\'' | '"') => quote = Some(ch),
            (None, '#') => return line.split_at(index),
            _ => {}
        }
    }
    (line, "")
}

/// A block-opening statement that lacks its colon. One-line compound
/// statements (`if x: y()`) already have one.
pub(crate) fn is_block_header(code: &str) -> bool {
    let trimmed = code.trim();
    let keyword = trimmed
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default();
    BLOCK_KEYWORDS.contains(&keyword) && !has_top_level_colon(trimmed)
}

/// A `:` outside brackets and strings. Colons closing a top-level
/// `lambda` parameter list and the `:=` operator do not count.
fn has_top_level_colon(code: &str) -> bool {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut lambdas = 0usize;
    let mut word = String::new();
    let mut chars = code.chars().peekable();
    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        if ch.is_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        if depth == 0 && word == "lambda" {
            lambdas += 1;
        }
        word.clear();
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 && chars.peek() != Some(&'=') => {
                if lambdas == 0 {
                    return true;
                }
                lambdas -= 1;
            }
            _ => {}
        }
    }
    false
}

pub(crate) fn insert_missing_colon(text: &str, line: u32) -> Option<(String, String)> {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let index = usize::try_from(line).ok()?.checked_sub(1)?;
    let candidates = [Some(index), index.checked_sub(1)];
    let target = candidates.into_iter().flatten().find(|candidate| {
        lines
            .get(*candidate)
            .is_some_and(|line| is_block_header(split_comment(line).0))
    })?;
    let original = lines.get(target)?.clone();
    let (code, comment) = split_comment(&original);
    let code_end = code.trim_end();
    let padding = code.get(code_end.len()..).unwrap_or_default();
    let updated = format!("{code_end}:{padding}{comment}");
    *lines.get_mut(target)? = updated;
    Some((
        join_like(text, &lines),
        format!("inserted ':' at the end of line {}", target + 1),
    ))
}

/// Openers never closed, as (line index, expected closer).
fn unclosed_brackets(text: &str) -> Vec<(usize, char)> {
    let mut stack: Vec<(usize, char)> = Vec::new();
    for (line_index, line) in text.lines().enumerate() {
        let (code, _) = split_comment(line);
        let mut quote: Option<char> = None;
        for ch in code.chars() {
            match (quote, ch) {
                (Some(open), c) if c == open => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(ch),
                (None, '(') => stack.push((line_index, ')')),
                (None, '[') => stack.push((line_index, ']')),
                (None, '{') => stack.push((line_index, '}')),
                (None, ')' | ']' | '}') => {
                    if stack.last().is_some_and(|(_, closer)| *closer == ch) {
                        stack.pop();
                    }
                }
                _ => {}
            }
        }
    }
    stack
}

pub(crate) fn close_unbalanced_brackets(text: &str, line: Option<u32>) -> Option<(String, String)> {
    let unclosed = unclosed_brackets(text);
    let wanted = line
        .and_then(|line| usize::try_from(line).ok())
        .and_then(|line| line.checked_sub(1));
    let on_line: Vec<_> = unclosed
        .iter()
        .filter(|(index, _)| Some(*index) == wanted)
        .copied()
        .collect();
    let selected = if on_line.is_empty() { unclosed } else { on_line };
    let (target, _) = *selected.last()?;
    let closers: String = selected
        .iter()
        .rev()
        .filter(|(index, _)| *index == target)
        .map(|(_, closer)| *closer)
        .collect();
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let original = lines.get(target)?.clone();
    let (code, comment) = split_comment(&original);
    let code_end = code.trim_end();
    let padding = code.get(code_end.len()..).unwrap_or_default();
    *lines.get_mut(target)? = format!("{code_end}{closers}{padding}{comment}");
    Some((
        join_like(text, &lines),
        format!("appended '{closers}' to line {}", target + 1),
    ))
}

pub(crate) fn expand_tabs(text: &str) -> Option<(String, String)> {
    let mut changed = 0usize;
    let lines: Vec<String> = text
        .lines()
        .map(|line| {
            let body = line.trim_start_matches(['\t', ' ']);
            let indent = line.get(..line.len() - body.len()).unwrap_or_default();
            if indent.contains('\t') {
                changed += 1;
                format!("{}{body}", indent.replace('\t', &" ".repeat(TAB_WIDTH)))
            } else {
                line.to_string()
            }
        })
        .collect();
    (changed > 0).then(|| {
        (
            join_like(text, &lines),
            format!("expanded leading tabs on {changed} line(s)"),
        )
    })
}

/// Rejoin lines, keeping the original trailing newline.
fn join_like(original: &str, lines: &[String]) -> String {
    let mut joined = lines.join("\n");
    if original.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

#[cfg(unix)]
fn grant_owner_read_write(path: &Path) -> GuardResult<Option<String>> {
    use std::os::unix::fs::PermissionsExt;
    let metadata =
        fs::metadata(path).map_err(|err| GuardError::io("failed to stat file for edit", err))?;
    let mode = metadata.permissions().mode() & 0o7777;
    if mode & 0o600 == 0o600 {
        return Ok(None);
    }
    let updated = mode | 0o600;
    fs::set_permissions(path, fs::Permissions::from_mode(updated))
        .map_err(|err| GuardError::io("failed to change file mode", err))?;
    Ok(Some(format!("changed mode {mode:o} to {updated:o}")))
}

#[cfg(not(unix))]
fn grant_owner_read_write(path: &Path) -> GuardResult<Option<String>> {
    let metadata =
        fs::metadata(path).map_err(|err| GuardError::io("failed to stat file for edit", err))?;
    let mut permissions = metadata.permissions();
    if !permissions.readonly() {
        return Ok(None);
    }
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
        .map_err(|err| GuardError::io("failed to change file mode", err))?;
    Ok(Some("cleared the read-only flag".to_string()))
}

fn create_missing_parent(path: &Path) -> GuardResult<Option<String>> {
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(None);
    };
    if parent.exists() {
        return Ok(None);
    }
    fs::create_dir_all(parent)
        .map_err(|err| GuardError::io("failed to create parent directories", err))?;
    Ok(Some(format!("created {}", parent.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_is_inserted_before_comment() {
        let (text, _) = insert_missing_colon("def run()  # entry\n    pass\n", 1).unwrap();
        assert_eq!(text, "def run():  # entry\n    pass\n");
    }

    #[test]
    fn colon_falls_back_to_previous_line() {
        let (text, description) = insert_missing_colon("if x\n    y = 1\n", 2).unwrap();
        assert_eq!(text, "if x:\n    y = 1\n");
        assert!(description.contains("line 1"));
    }

    #[test]
    fn colon_skips_non_headers() {
        assert!(insert_missing_colon("x = 1\n", 1).is_none());
        assert!(insert_missing_colon("def ok():\n", 1).is_none());
    }

    #[test]
    fn one_line_compound_statements_are_complete() {
        for line in [
            "if x: print(x)",
            "while False: pass",
            "try: import y",
            "else: z = {'a': 1}",
            "for k in d: total += d[k]",
        ] {
            assert!(!is_block_header(line), "{line}");
        }
        assert!(insert_missing_colon("if x: print(x)\n", 1).is_none());
    }

    #[test]
    fn colons_inside_brackets_strings_and_lambdas_do_not_count() {
        assert!(is_block_header("if d[1:2]"));
        assert!(is_block_header("if x == ':'"));
        assert!(is_block_header("while chunk := f.read()"));
        assert!(is_block_header("with lock if ok else lambda: 0"));
        assert!(!is_block_header("if f(lambda: 1):"));
    }

    #[test]
    fn brackets_close_on_the_opening_line() {
        let (text, _) = close_unbalanced_brackets("x = foo([1, 2\ny = 3\n", Some(1)).unwrap();
        assert_eq!(text, "x = foo([1, 2])\ny = 3\n");
        assert!(close_unbalanced_brackets("x = (1)\n", Some(1)).is_none());
    }

    #[test]
    fn brackets_in_strings_are_ignored() {
        assert!(close_unbalanced_brackets("s = '('\n", None).is_none());
    }

    #[test]
    fn tabs_expand_in_indentation_only() {
        let (text, _) = expand_tabs("def f():\n\treturn '\t'\n").unwrap();
        assert_eq!(text, "def f():\n    return '\t'\n");
        assert!(expand_tabs("x = 1\n").is_none());
    }

    #[test]
    fn timeout_extension_respects_cap() {
        let op = ConfigOp::ExtendTimeout { factor: 2 };
        assert_eq!(op.adjusted_timeout_ms(1000, 10_000), Some(2000));
        assert_eq!(op.adjusted_timeout_ms(8000, 10_000), Some(10_000));
        assert_eq!(op.adjusted_timeout_ms(10_000, 10_000), None);
    }

    #[test]
    fn parent_creation_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/file.txt");
        assert!(create_missing_parent(&target).unwrap().is_some());
        assert!(dir.path().join("a/b").is_dir());
        assert!(create_missing_parent(&target).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn owner_bits_are_granted() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.py");
        fs::write(&path, "x = 1\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();
        assert!(EditOp::GrantOwnerReadWrite.apply(&path, None).unwrap().is_some());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }
}
