//! Fixture: floods a stream with output.
//!
//! Usage:
//!   guardrun-spew <bytes> [stdout|stderr]

use std::io::{self, Write};

const CHUNK: [u8; 4096] = [b'x'; 4096];

fn main() -> io::Result<()> {
    let mut args = std::env::args().skip(1);
    let mut remaining: usize = args
        .next()
        .and_then(|value| value.parse().ok())
        .unwrap_or(1024 * 1024);
    let mut out: Box<dyn Write> = match args.next().as_deref() {
        Some("stderr") => Box::new(io::stderr().lock()),
        _ => Box::new(io::stdout().lock()),
    };
    while remaining > 0 {
        let len = remaining.min(CHUNK.len());
        let chunk = CHUNK.get(..len).unwrap_or_default();
        if out.write_all(chunk).is_err() {
            // Reader went away; that is the point of the exercise.
            break;
        }
        remaining -= len;
    }
    out.flush().ok();
    Ok(())
}
