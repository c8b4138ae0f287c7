//! guardrun CLI: policy-gated sandboxed execution with fault recovery.
//!
//! Thin command-line surface over the `guardrun` library. Every run command
//! prints a `SafetyReport` (human summary or `--json`) and maps it onto a
//! process exit code.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use guardrun::config::GuardConfig;
use guardrun::model::context::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS};
use guardrun::{
    load_config_file, ClassifyOptions, ErrorClassifier, ExecutionContext, GuardError, GuardResult,
    Interpreter, SafetyOrchestrator, SecurityGate,
};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

mod batch;
mod output;

/// Exit code for configuration and usage errors.
const USAGE_EXIT_CODE: i32 = 3;

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(
    name = "guardrun",
    version,
    about = "Run untrusted commands behind a security gate, with fault classification and recovery"
)]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    /// Log more (-v debug, -vv trace); overrides GUARDRUN_LOG
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (JSON, or YAML by extension)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that executes something.
#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[arg(long)]
    json: bool,
    #[arg(long, help = "Working directory (default: current directory)")]
    cwd: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS, help = "Wall-clock timeout in milliseconds")]
    timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_BYTES, help = "Per-stream output ceiling")]
    max_output_bytes: usize,
    #[arg(long, default_value_t = 3, help = "Repair attempts per fault")]
    max_attempts: usize,
    #[arg(long, help = "Report failures without attempting recovery")]
    no_recover: bool,
    #[arg(long, help = "Copy files changed in the sandbox back to the working directory")]
    write_back: bool,
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command under the orchestrator
    Exec {
        #[command(flatten)]
        run: RunArgs,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Run inline source with an interpreter
    Code {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, short = 'i', default_value = "python", value_parser = parse_interpreter)]
        interpreter: Interpreter,
        #[arg(help = "Source file, or - for stdin (default: stdin)")]
        source: Option<PathBuf>,
    },
    /// Write a file, repairing or rolling back content that fails validation
    Write {
        #[command(flatten)]
        run: RunArgs,
        #[arg(help = "File to write, relative to the working directory")]
        path: PathBuf,
        #[arg(long, help = "Read the new content from this file (default: stdin)")]
        content: Option<PathBuf>,
    },
    /// Classify diagnostic output into faults
    Classify {
        #[arg(long)]
        json: bool,
        #[arg(long, help = "Resolve relative paths against this directory")]
        cwd: Option<PathBuf>,
        #[arg(long, help = "Attribute faults to this file when the text names none")]
        file_path: Option<PathBuf>,
        #[arg(help = "Log file, or - for stdin (default: stdin)")]
        log: Option<PathBuf>,
    },
    /// Show what the security gate decides for a command, without running it
    Explain {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Run commands from a file concurrently, one command per line
    Batch {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, short = 'j', default_value_t = 4, help = "Concurrent runs")]
        jobs: usize,
        file: PathBuf,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Self::Exec { run, .. }
            | Self::Code { run, .. }
            | Self::Write { run, .. }
            | Self::Batch { run, .. } => run.json,
            Self::Classify { json, .. } | Self::Explain { json, .. } => *json,
            Self::Completions { .. } => false,
        }
    }
}

/// Configure color output based on CLI flag and environment
fn configure_colors(mode: ColorMode) -> bool {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            if std::env::var_os("NO_COLOR").is_some() {
                false
            } else {
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    };

    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set

    use_color
}

/// Install the stderr subscriber. `-v` wins over `GUARDRUN_LOG`.
fn init_tracing(verbose: u8, use_color: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::try_from_env("GUARDRUN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(use_color)
        .with_target(false)
        .try_init()
        .ok();
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout and succeed.
            let code = if err.use_stderr() { USAGE_EXIT_CODE } else { 0 };
            err.print().ok();
            std::process::exit(code);
        }
    }
}

fn main() {
    let cli = parse_cli();
    let use_color = configure_colors(cli.color);
    init_tracing(cli.verbose, use_color);
    let json = cli.command.json();
    let code = match dispatch(cli.command, cli.config.as_deref()) {
        Ok(code) => code,
        Err(err) => output::emit_error(json, err),
    };
    std::process::exit(code);
}

fn dispatch(command: Commands, config: Option<&Path>) -> GuardResult<i32> {
    match command {
        Commands::Exec { run, command } => cmd_exec(config, &run, &command),
        Commands::Code {
            run,
            interpreter,
            source,
        } => cmd_code(config, &run, interpreter, source.as_deref()),
        Commands::Write { run, path, content } => cmd_write(config, &run, &path, content.as_deref()),
        Commands::Classify {
            json,
            cwd,
            file_path,
            log,
        } => cmd_classify(config, json, cwd, file_path, log.as_deref()),
        Commands::Explain { json, cwd, command } => cmd_explain(config, json, cwd, &command),
        Commands::Batch { run, jobs, file } => batch::cmd_batch(config, &run, jobs, &file),
        Commands::Completions { shell } => Ok(cmd_completions(shell)),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

fn cmd_exec(config: Option<&Path>, run: &RunArgs, command: &[String]) -> GuardResult<i32> {
    let command = join_command(command);
    let (orchestrator, context) = prepare(config, run)?;
    let report = orchestrator.run(&command, &context, run.max_attempts, !run.no_recover);
    output::emit_report(run.json, &report)
}

fn cmd_code(
    config: Option<&Path>,
    run: &RunArgs,
    interpreter: Interpreter,
    source: Option<&Path>,
) -> GuardResult<i32> {
    let source = read_input(source)?;
    let (orchestrator, context) = prepare(config, run)?;
    let report = orchestrator.run_code(
        &source,
        interpreter,
        &context,
        run.max_attempts,
        !run.no_recover,
    );
    output::emit_report(run.json, &report)
}

fn cmd_write(
    config: Option<&Path>,
    run: &RunArgs,
    path: &Path,
    content: Option<&Path>,
) -> GuardResult<i32> {
    let content = read_input(content)?;
    let (orchestrator, context) = prepare(config, run)?;
    let report = orchestrator.run_file_mutation(
        path,
        &content,
        &context,
        run.max_attempts,
        !run.no_recover,
    );
    output::emit_report(run.json, &report)
}

fn cmd_classify(
    config: Option<&Path>,
    json: bool,
    cwd: Option<PathBuf>,
    file_path: Option<PathBuf>,
    log: Option<&Path>,
) -> GuardResult<i32> {
    let cwd = resolve_cwd(cwd)?;
    let config = load_config(config)?;
    let text = read_input(log)?;
    let classifier = ErrorClassifier::new(config.ledger);
    let options = ClassifyOptions {
        file_path,
        base_dir: Some(cwd),
        workspace_dir: None,
    };
    let faults = classifier.classify_with(&text, &options);
    output::emit_faults(json, &faults)?;
    Ok(0)
}

fn cmd_explain(
    config: Option<&Path>,
    json: bool,
    cwd: Option<PathBuf>,
    command: &[String],
) -> GuardResult<i32> {
    let cwd = resolve_cwd(cwd)?;
    let config = load_config(config)?;
    let gate = SecurityGate::new(config.gate)?;
    let context = ExecutionContext::builder(cwd).build()?;
    let explanation = gate.explain(&join_command(command), &context);
    output::emit_explanation(json, &explanation)?;
    Ok(if explanation.allowed { 0 } else { 2 })
}

fn cmd_completions(shell: Shell) -> i32 {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    0
}

// =============================================================================
// Shared setup
// =============================================================================

/// Load configuration and build the orchestrator and context for a run.
fn prepare(config: Option<&Path>, run: &RunArgs) -> GuardResult<(SafetyOrchestrator, ExecutionContext)> {
    let cwd = resolve_cwd(run.cwd.clone())?;
    let config = load_config(config)?;
    let orchestrator = SafetyOrchestrator::from_config(&config)?;
    let context = build_context(run, cwd)?;
    Ok((orchestrator, context))
}

fn build_context(run: &RunArgs, cwd: PathBuf) -> GuardResult<ExecutionContext> {
    run.env
        .iter()
        .fold(ExecutionContext::builder(cwd), |builder, (key, value)| {
            builder.env(key, value)
        })
        .timeout_ms(run.timeout_ms)
        .max_output_bytes(run.max_output_bytes)
        .write_back(run.write_back)
        .build()
}

/// The configured file, or defaults. A missing project root becomes the
/// working directory.
/// Without a configured project root, the directory guardrun was started in
/// is the root. `--cwd` is checked against it and never widens it.
fn load_config(path: Option<&Path>) -> GuardResult<GuardConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => GuardConfig::default(),
    };
    if config.gate.project_root.is_none() {
        let current = std::env::current_dir()
            .map_err(|err| GuardError::io("failed to read current directory", err))?;
        config.gate.project_root = Some(current);
    }
    tracing::debug!(
        project_root = ?config.gate.project_root,
        from_file = path.is_some(),
        "configuration loaded"
    );
    Ok(config)
}

fn resolve_cwd(cwd: Option<PathBuf>) -> GuardResult<PathBuf> {
    let current = std::env::current_dir()
        .map_err(|err| GuardError::io("failed to read current directory", err))?;
    Ok(match cwd {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => current.join(dir),
        None => current,
    })
}

/// A single argument is taken as a complete shell command line.
fn join_command(command: &[String]) -> String {
    match command {
        [single] => single.clone(),
        parts => shell_words::join(parts),
    }
}

/// Read a file, or stdin when the path is absent or `-`.
fn read_input(path: Option<&Path>) -> GuardResult<String> {
    match path {
        Some(path) if path != Path::new("-") => fs::read_to_string(path).map_err(|err| {
            GuardError::io(format!("failed to read {}", path.display()), err)
        }),
        _ => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .map_err(|err| GuardError::io("failed to read stdin", err))?;
            Ok(text)
        }
    }
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{value}`")),
    }
}

fn parse_interpreter(value: &str) -> Result<Interpreter, String> {
    value.parse().map_err(|err: GuardError| err.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_argument_is_a_shell_line() {
        let command = vec!["echo hi | wc -c".to_string()];
        assert_eq!(join_command(&command), "echo hi | wc -c");
    }

    #[test]
    fn multiple_arguments_are_quoted() {
        let command = vec!["echo".to_string(), "a b".to_string()];
        assert_eq!(join_command(&command), "echo 'a b'");
    }

    #[test]
    fn env_pairs_need_a_key() {
        assert_eq!(
            parse_env_pair("FOO=bar=baz"),
            Ok(("FOO".to_string(), "bar=baz".to_string()))
        );
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn interpreter_names_parse() {
        assert_eq!(parse_interpreter("py"), Ok(Interpreter::Python));
        assert!(parse_interpreter("cobol").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
