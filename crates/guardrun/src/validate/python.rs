//! Structural checks for Python sources: block-header colons and bracket
//! balance. Not a parser; strings and comments are blanked out first so
//! their contents never count.

use crate::recovery::is_block_header;

/// One structural problem, 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PythonIssue {
    pub line: usize,
    pub message: String,
}

/// Scanner state carried across lines.
#[derive(Debug, Default)]
struct Scanner {
    /// Open triple-quote delimiter, if a string spans lines.
    triple: Option<&'static str>,
    /// Unclosed openers as (line, opener).
    stack: Vec<(usize, char)>,
    issues: Vec<PythonIssue>,
}

pub(crate) fn python_issues(text: &str) -> Vec<PythonIssue> {
    let mut scanner = Scanner::default();
    for (index, raw) in text.lines().enumerate() {
        scanner.scan_line(index + 1, raw);
    }
    let Scanner {
        stack, mut issues, ..
    } = scanner;
    issues.extend(stack.into_iter().map(|(line, opener)| PythonIssue {
        line,
        message: format!("'{opener}' was never closed"),
    }));
    issues.sort_by_key(|issue| issue.line);
    issues
}

impl Scanner {
    fn scan_line(&mut self, line: usize, raw: &str) {
        let started_in_string = self.triple.is_some();
        let depth_before = self.stack.len();
        let code = self.blank_strings(raw);
        for ch in code.chars() {
            self.bracket(line, ch);
        }
        let continues = raw.trim_end().ends_with('\\');
        if !started_in_string
            && depth_before == 0
            && self.stack.is_empty()
            && !continues
            && is_block_header(&code)
        {
            self.issues.push(PythonIssue {
                line,
                message: "expected ':'".to_string(),
            });
        }
    }

    fn bracket(&mut self, line: usize, ch: char) {
        let opener = match ch {
            '(' | '[' | '{' => {
                self.stack.push((line, ch));
                return;
            }
            ')' => '(',
            ']' => '[',
            '}' => '{',
            _ => return,
        };
        match self.stack.pop() {
            Some((_, open)) if open == opener => {}
            Some((open_line, open)) => {
                let message = if open_line == line {
                    format!("closing parenthesis '{ch}' does not match opening parenthesis '{open}'")
                } else {
                    format!(
                        "closing parenthesis '{ch}' does not match opening parenthesis '{open}' on line {open_line}"
                    )
                };
                self.issues.push(PythonIssue { line, message });
            }
            None => self.issues.push(PythonIssue {
                line,
                message: format!("unmatched '{ch}'"),
            }),
        }
    }

    /// The line with string contents and comments removed.
    fn blank_strings(&mut self, raw: &str) -> String {
        let mut code = String::with_capacity(raw.len());
        let mut quote: Option<char> = None;
        let mut offset = 0;
        while let Some(ch) = raw.get(offset..).and_then(|rest| rest.chars().next()) {
            let rest = raw.get(offset..).unwrap_or_default();
            if let Some(delimiter) = self.triple {
                if rest.starts_with(delimiter) {
                    self.triple = None;
                    offset += delimiter.len();
                } else {
                    offset += ch.len_utf8();
                }
                continue;
            }
            match quote {
                Some(open) => {
                    if ch == '\\' {
                        offset += ch.len_utf8();
                        offset += rest.chars().nth(1).map_or(0, char::len_utf8);
                        continue;
                    }
                    if ch == open {
                        quote = None;
                    }
                }
                None if rest.starts_with("\"\"\"") => {
                    self.triple = Some("\"\"\"");
                    offset += 3;
                    continue;
                }
                None if rest.starts_with("'''") => {
                    self.triple = Some("'''");
                    offset += 3;
                    continue;
                }
                None if ch == '\'' || ch == '"' => quote = Some(ch),
                None if ch == '#' => break,
                None => code.push(ch),
            }
            offset += ch.len_utf8();
        }
        code
    }
}
