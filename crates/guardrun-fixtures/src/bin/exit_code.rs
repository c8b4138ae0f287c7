//! Fixture: exits with the given code, optionally printing a line to stderr.
//!
//! Usage:
//!   guardrun-exit-code <code> [stderr-line]

#![allow(clippy::print_stderr)]

use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let code = args
        .next()
        .and_then(|value| value.parse::<u8>().ok())
        .unwrap_or(0);
    if let Some(line) = args.next() {
        eprintln!("{line}");
    }
    ExitCode::from(code)
}
