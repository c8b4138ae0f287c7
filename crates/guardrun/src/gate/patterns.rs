//! Static tables and shell-text helpers used by the gate.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// One destructive-program rule. `applies` sees the arguments after the
/// program token and decides whether this invocation is the dangerous form.
pub(crate) struct DenyRule {
    pub programs: &'static [&'static str],
    /// Match program names that start with an entry (`mkfs.ext4`).
    pub prefix: bool,
    pub applies: fn(&[String]) -> bool,
    pub reason: &'static str,
}

fn always(_: &[String]) -> bool {
    true
}

fn has_recursive_flag(args: &[String]) -> bool {
    args.iter().take_while(|arg| arg.as_str() != "--").any(|arg| {
        arg == "--recursive"
            || (arg.starts_with('-')
                && !arg.starts_with("--")
                && arg.chars().skip(1).any(|c| c == 'r' || c == 'R'))
    })
}

/// `kill -1`, `kill -9 -1`, `kill -KILL -1`: the target pid -1 is every process.
fn targets_all_processes(args: &[String]) -> bool {
    args.last().is_some_and(|arg| arg == "-1")
}

fn init_runlevel_halt(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "0" || arg == "6")
}

fn systemctl_power(args: &[String]) -> bool {
    args.iter()
        .any(|arg| matches!(arg.as_str(), "poweroff" | "reboot" | "halt" | "kexec"))
}

pub(crate) const DENY_RULES: &[DenyRule] = &[
    DenyRule {
        programs: &["rm"],
        prefix: false,
        applies: has_recursive_flag,
        reason: "recursive delete",
    },
    DenyRule {
        programs: &["mkfs"],
        prefix: true,
        applies: always,
        reason: "disk format",
    },
    DenyRule {
        programs: &["fdisk", "sfdisk", "cfdisk", "parted", "wipefs", "format", "mkswap"],
        prefix: false,
        applies: always,
        reason: "disk partitioning",
    },
    DenyRule {
        programs: &["sudo", "su", "doas", "pkexec"],
        prefix: false,
        applies: always,
        reason: "privilege escalation",
    },
    DenyRule {
        programs: &["killall", "pkill"],
        prefix: false,
        applies: always,
        reason: "kill-all",
    },
    DenyRule {
        programs: &["kill"],
        prefix: false,
        applies: targets_all_processes,
        reason: "kill-all",
    },
    DenyRule {
        programs: &["shutdown", "reboot", "halt", "poweroff"],
        prefix: false,
        applies: always,
        reason: "system shutdown",
    },
    DenyRule {
        programs: &["init", "telinit"],
        prefix: false,
        applies: init_runlevel_halt,
        reason: "system shutdown",
    },
    DenyRule {
        programs: &["systemctl"],
        prefix: false,
        applies: systemctl_power,
        reason: "system shutdown",
    },
];

impl DenyRule {
    pub(crate) fn matches(&self, program: &str, args: &[String]) -> bool {
        let named = self.programs.iter().any(|name| {
            if self.prefix {
                program.starts_with(name)
            } else {
                program == *name
            }
        });
        named && (self.applies)(args)
    }
}

/// Built-in dangerous shell patterns as `(name, regex)`.
const DANGEROUS_PATTERN_SOURCES: &[(&str, &str)] = &[
    (
        "device redirect",
        r"(?:>|\bof=)\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|mem\b|kmem|port)",
    ),
    (
        "remote download piped to shell",
        r"\b(?:curl|wget|fetch)\b[^|]*\|\s*(?:sudo\s+)?(?:env\s+)?(?:ba|z|da|k|c)?sh\b",
    ),
    (
        "remote download piped to interpreter",
        r"\b(?:curl|wget)\b[^|]*\|\s*(?:python[0-9.]*|perl|ruby|node)\b",
    ),
    ("eval/exec indirection", r"(?:^|[;&|(`\s])(?:eval|exec)\s"),
    (
        "command substitution of a download",
        r"(?:\$\(|`)\s*(?:curl|wget)\b",
    ),
    ("fork bomb", r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:\s*&"),
    ("network socket device", r"/dev/(?:tcp|udp)/"),
];

#[derive(Debug)]
pub(crate) struct DangerousPattern {
    pub name: String,
    pub regex: Regex,
}

/// Built-in patterns, compiled once per process.
pub(crate) fn builtin_patterns() -> &'static [DangerousPattern] {
    static PATTERNS: OnceLock<Vec<DangerousPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DANGEROUS_PATTERN_SOURCES
            .iter()
            .filter_map(|(name, source)| {
                Regex::new(source).ok().map(|regex| DangerousPattern {
                    name: (*name).to_string(),
                    regex,
                })
            })
            .collect()
    })
}

/// Programs that run their arguments as another command.
const WRAPPERS: &[&str] = &[
    "env", "nohup", "nice", "time", "timeout", "command", "builtin", "exec", "stdbuf", "xargs",
];

/// Shells whose `-c` operand is more shell text.
const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "mksh", "ash"];

/// Shell options that consume the following argument.
const SHELL_OPTIONS_WITH_VALUE: &[&str] = &["-o", "+o", "-O", "+O", "--rcfile", "--init-file"];

/// The shell text a segment hands to another shell: the `-c` operand of a
/// shell program or the arguments of `eval`.
pub(crate) fn inline_script(program: &str, args: &[String]) -> Option<String> {
    if program == "eval" {
        return (!args.is_empty()).then(|| args.join(" "));
    }
    if !SHELLS.contains(&program) {
        return None;
    }
    let mut rest = args.iter();
    while let Some(arg) = rest.next() {
        if SHELL_OPTIONS_WITH_VALUE.contains(&arg.as_str()) {
            rest.next();
            continue;
        }
        if arg == "--" || !(arg.starts_with('-') || arg.starts_with('+')) {
            return None;
        }
        if !arg.starts_with("--") && arg.chars().skip(1).any(|c| c == 'c') {
            return rest.next().cloned();
        }
    }
    None
}

/// Split shell text into simple-command segments.
///
/// Separators are `|`, `||`, `&&`, `;`, `&` and newlines outside quotes.
/// Bodies of `$(...)` and backtick substitutions are returned as extra
/// segments so nested commands are gated too.
pub(crate) fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in command.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => {
                quote = None;
                current.push(c);
            }
            (Some(_), _) => {
                if c == '\\' && quote == Some('"') {
                    escaped = true;
                }
                current.push(c);
            }
            (None, '\\') => {
                escaped = true;
                current.push(c);
            }
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '|' | '&' | ';' | '\n') => push_segment(&mut segments, &mut current),
            (None, _) => current.push(c),
        }
    }
    push_segment(&mut segments, &mut current);
    let nested: Vec<String> = substitution_bodies(command)
        .into_iter()
        .flat_map(|body| split_segments(&body))
        .collect();
    segments.extend(nested);
    segments
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    current.clear();
}

fn substitution_bodies(command: &str) -> Vec<String> {
    static SUBSTITUTION: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(regex) = SUBSTITUTION
        .get_or_init(|| Regex::new(r"\$\(([^()]*)\)|`([^`]*)`").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    regex
        .captures_iter(command)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|body| body.as_str().to_string())
        .filter(|body| !body.trim().is_empty())
        .collect()
}

/// Tokenize one segment; unbalanced quoting falls back to whitespace split.
pub(crate) fn tokenize(segment: &str) -> Vec<String> {
    shell_words::split(segment)
        .unwrap_or_else(|_| segment.split_whitespace().map(str::to_string).collect())
}

/// The program basename and its arguments for one segment, skipping
/// variable assignments, subshell openers and wrapper programs.
pub(crate) fn program_and_args(tokens: &[String]) -> Option<(String, Vec<String>)> {
    let mut rest = tokens;
    loop {
        let (first, tail) = rest.split_first()?;
        let token = first.trim_start_matches(['(', '{', '!']);
        if token.is_empty() || is_assignment(token) {
            rest = tail;
            continue;
        }
        let program = basename(token);
        if WRAPPERS.contains(&program.as_str()) {
            rest = skip_wrapper_options(&program, tail);
            continue;
        }
        return Some((program, tail.to_vec()));
    }
}

fn skip_wrapper_options<'a>(program: &str, mut tail: &'a [String]) -> &'a [String] {
    while let Some((first, next)) = tail.split_first() {
        if first.starts_with('-') || (program == "env" && is_assignment(first)) {
            tail = next;
        } else {
            break;
        }
    }
    if program == "timeout" {
        // The duration operand precedes the wrapped command.
        tail = tail.get(1..).unwrap_or_default();
    }
    tail
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

fn basename(token: &str) -> String {
    Path::new(token)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(token)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    #[test]
    fn segments_split_on_operators_outside_quotes() {
        let segments = split_segments("echo 'a;b' && ls | wc -l; true");
        assert_eq!(segments, vec!["echo 'a;b'", "ls", "wc -l", "true"]);
    }

    #[test]
    fn substitution_bodies_become_segments() {
        let segments = split_segments("echo $(rm -rf /tmp/x)");
        assert!(segments.iter().any(|segment| segment == "rm -rf /tmp/x"));
    }

    #[test]
    fn program_skips_assignments_and_wrappers() {
        let tokens = words(&["FOO=1", "env", "-i", "BAR=2", "/usr/bin/sudo", "ls"]);
        let (program, args) = program_and_args(&tokens).unwrap();
        assert_eq!(program, "sudo");
        assert_eq!(args, words(&["ls"]));

        let tokens = words(&["timeout", "-s", "KILL", "5", "rm", "-r", "x"]);
        let (program, _) = program_and_args(&tokens).unwrap();
        assert_ne!(program, "timeout");
    }

    #[test]
    fn inline_script_of_shells_and_eval() {
        assert_eq!(
            inline_script("sh", &words(&["-c", "rm -rf /"])).as_deref(),
            Some("rm -rf /")
        );
        assert_eq!(
            inline_script("bash", &words(&["-o", "pipefail", "-ec", "sudo ls"])).as_deref(),
            Some("sudo ls")
        );
        assert_eq!(
            inline_script("eval", &words(&["rm", "-rf", "/"])).as_deref(),
            Some("rm -rf /")
        );
        assert_eq!(inline_script("sh", &words(&["script.sh"])), None);
        assert_eq!(inline_script("python3", &words(&["-c", "print(1)"])), None);
    }

    #[test]
    fn recursive_flag_detection() {
        assert!(has_recursive_flag(&words(&["-rf", "dir"])));
        assert!(has_recursive_flag(&words(&["-f", "--recursive", "dir"])));
        assert!(!has_recursive_flag(&words(&["-f", "file.txt"])));
        assert!(!has_recursive_flag(&words(&["--", "-r"])));
    }

    #[test]
    fn kill_all_only_for_minus_one_target() {
        assert!(targets_all_processes(&words(&["-9", "-1"])));
        assert!(!targets_all_processes(&words(&["-1", "1234"])));
    }

    #[test]
    fn builtin_patterns_all_compile() {
        assert_eq!(builtin_patterns().len(), DANGEROUS_PATTERN_SOURCES.len());
    }
}
