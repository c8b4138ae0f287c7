//! Fixture: a process tree that outlives a naive kill.
//!
//! Usage:
//!   guardrun-sleep-tree <pid-file> [seconds]
//!
//! The parent spawns a child, the child spawns a grandchild, and the
//! grandchild writes its pid to `<pid-file>` before sleeping. Each level
//! waits on the next, so only a process-group kill stops all three.

#![allow(clippy::print_stderr)]

use std::process::{Command, ExitCode};
use std::time::Duration;
use std::{env, fs, process, thread};

const DEFAULT_SECONDS: u64 = 30;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--level") => run_level(args.get(1), args.get(2), args.get(3)),
        Some(pid_file) => spawn_level("1", pid_file, args.get(1)),
        None => {
            eprintln!("usage: guardrun-sleep-tree <pid-file> [seconds]");
            ExitCode::from(2)
        }
    }
}

fn run_level(level: Option<&String>, pid_file: Option<&String>, seconds: Option<&String>) -> ExitCode {
    let (Some(level), Some(pid_file)) = (level, pid_file) else {
        return ExitCode::from(2);
    };
    if level == "1" {
        return spawn_level("2", pid_file, seconds);
    }
    if fs::write(pid_file, process::id().to_string()).is_err() {
        eprintln!("cannot write pid file {pid_file}");
        return ExitCode::from(1);
    }
    let seconds = seconds
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);
    thread::sleep(Duration::from_secs(seconds));
    ExitCode::SUCCESS
}

fn spawn_level(level: &str, pid_file: &str, seconds: Option<&String>) -> ExitCode {
    let Ok(exe) = env::current_exe() else {
        return ExitCode::from(1);
    };
    let mut command = Command::new(exe);
    command.args(["--level", level, pid_file]);
    if let Some(seconds) = seconds {
        command.arg(seconds);
    }
    match command.status() {
        Ok(status) if status.success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("spawn failed: {err}");
            ExitCode::from(1)
        }
    }
}
