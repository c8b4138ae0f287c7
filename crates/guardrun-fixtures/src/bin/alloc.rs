//! Fixture: allocates and touches memory, then holds it.
//!
//! Usage:
//!   guardrun-alloc <megabytes> [hold-ms]

#![allow(clippy::print_stdout)]

use std::hint::black_box;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

const MIB: usize = 1024 * 1024;
const PAGE: usize = 4096;

fn main() {
    let mut args = std::env::args().skip(1);
    let megabytes: usize = args.next().and_then(|value| value.parse().ok()).unwrap_or(64);
    let hold_ms: u64 = args.next().and_then(|value| value.parse().ok()).unwrap_or(500);

    let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(megabytes);
    for _ in 0..megabytes {
        let mut block = vec![0u8; MIB];
        for byte in block.iter_mut().step_by(PAGE) {
            *byte = 1;
        }
        blocks.push(black_box(block));
    }
    println!("allocated {megabytes} MiB");
    io::stdout().flush().ok();
    thread::sleep(Duration::from_millis(hold_ms));
    black_box(&blocks);
}
