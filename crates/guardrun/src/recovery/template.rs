//! Command templates with typed slots.
//!
//! A template such as `pip install {package_name}` is parsed once into
//! literal segments and [`Slot`]s. Rendering binds every slot from a
//! [`SlotBindings`] and shell-quotes the value, so fault text can never
//! inject shell syntax into a repair command.

use crate::error::{GuardError, GuardResult};
use crate::model::DetectedFault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A value a recovery template can reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    FilePath,
    PackageName,
    CommandName,
    LineNumber,
}

impl Slot {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilePath => "file_path",
            Self::PackageName => "package_name",
            Self::CommandName => "command_name",
            Self::LineNumber => "line_number",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "file_path" => Some(Self::FilePath),
            "package_name" => Some(Self::PackageName),
            "command_name" => Some(Self::CommandName),
            "line_number" => Some(Self::LineNumber),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Slot),
}

/// Slot values bound from one fault.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotBindings {
    pub file_path: Option<String>,
    pub package_name: Option<String>,
    pub command_name: Option<String>,
    pub line_number: Option<u32>,
}

impl SlotBindings {
    /// Bind from `fault`. File paths under `working_dir` are rendered
    /// relative to it so the command edits the sandbox copy, which is then
    /// written back.
    #[must_use]
    pub fn from_fault(fault: &DetectedFault, working_dir: &Path) -> Self {
        let file_path = fault.file_path.as_ref().map(|path| {
            path.strip_prefix(working_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned()
        });
        Self {
            file_path,
            package_name: fault
                .capture("package")
                .or_else(|| fault.capture("module"))
                .map(str::to_string),
            command_name: fault.capture("command").map(str::to_string),
            line_number: fault.line_number,
        }
    }

    fn get(&self, slot: Slot) -> Option<String> {
        match slot {
            Slot::FilePath => self.file_path.clone(),
            Slot::PackageName => self.package_name.clone(),
            Slot::CommandName => self.command_name.clone(),
            Slot::LineNumber => self.line_number.map(|line| line.to_string()),
        }
    }
}

/// A parsed command template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Parse `{slot}` placeholders.
    ///
    /// # Errors
    /// `E_TEMPLATE` for an unknown slot name or an unbalanced brace.
    pub fn parse(source: &str) -> GuardResult<Self> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find(['{', '}']) {
            let (literal, tail) = rest.split_at(open);
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }
            if tail.starts_with('}') {
                return Err(unbalanced(source));
            }
            let close = tail.find('}').ok_or_else(|| unbalanced(source))?;
            let name = tail.get(1..close).unwrap_or_default();
            let slot = Slot::from_name(name).ok_or_else(|| {
                GuardError::template(
                    format!("unknown template slot `{name}`"),
                    serde_json::json!({
                        "template": source,
                        "slots": ["file_path", "package_name", "command_name", "line_number"],
                    }),
                )
            })?;
            segments.push(Segment::Slot(slot));
            rest = tail.get(close + 1..).unwrap_or_default();
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Slots referenced by the template, in order of appearance.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Slot(slot) => Some(*slot),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every slot, shell-quoted.
    ///
    /// # Errors
    /// `E_TEMPLATE` naming the first slot with no binding.
    pub fn render(&self, bindings: &SlotBindings) -> GuardResult<String> {
        let mut rendered = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Slot(slot) => {
                    let value = bindings.get(*slot).ok_or_else(|| {
                        GuardError::template(
                            format!("no value for template slot `{slot}`"),
                            serde_json::json!({ "template": self.source, "slot": slot }),
                        )
                    })?;
                    rendered.push_str(&shell_words::quote(&value));
                }
            }
        }
        Ok(rendered)
    }
}

fn unbalanced(source: &str) -> GuardError {
    GuardError::template(
        "unbalanced brace in template",
        serde_json::json!({ "template": source }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn parses_slots_in_order() {
        let template = CommandTemplate::parse("chmod u+rw {file_path} # {line_number}").unwrap();
        let slots: Vec<_> = template.slots().collect();
        assert_eq!(slots, vec![Slot::FilePath, Slot::LineNumber]);
    }

    #[test]
    fn values_are_shell_quoted() {
        let template = CommandTemplate::parse("pip install {package_name}").unwrap();
        let bindings = SlotBindings {
            package_name: Some("x; rm -rf /".to_string()),
            ..SlotBindings::default()
        };
        assert_eq!(template.render(&bindings).unwrap(), "pip install 'x; rm -rf /'");
    }

    #[test]
    fn missing_binding_is_a_template_error() {
        let template = CommandTemplate::parse("pip install {package_name}").unwrap();
        let err = template.render(&SlotBindings::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Template);
    }

    #[test]
    fn unknown_and_unbalanced_slots_are_rejected() {
        assert!(CommandTemplate::parse("echo {nope}").is_err());
        assert!(CommandTemplate::parse("echo {file_path").is_err());
        assert!(CommandTemplate::parse("echo }").is_err());
    }
}
