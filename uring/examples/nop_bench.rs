//! Nop round-trip benchmark. Measures how submission batching amortizes
//! the enter syscall: ops/sec and ns/op across a matrix of batch sizes,
//! optionally with a kernel submission-polling thread.
//!
//! Usage:
//!   cargo run --release -p uring --example nop_bench -- [OPTIONS]
//!
//! Options:
//!   --seconds <n>    Measurement time per batch size (default: 2)
//!   --depth <n>      Ring entries (default: 256)
//!   --sqpoll         Add a kernel submission-polling run
//!   --verbose        Log ring negotiation at debug level

use std::time::{Duration, Instant};

use uring::{Completion, ConfigBuilder, Ring};

// ── Measurement ─────────────────────────────────────────────────────

struct BatchResult {
    batch: u32,
    ops_per_sec: f64,
    ns_per_op: f64,
}

fn run_batch(mut ring: Ring, batch: u32, duration: Duration) -> BatchResult {
    let mut out = vec![Completion::default(); batch as usize];
    let mut ops: u64 = 0;
    let start = Instant::now();

    while start.elapsed() < duration {
        let slots = ring.try_slots(batch);
        for &slot in &slots {
            ring.prepare(slot, |sqe| sqe.prep_nop(0));
        }
        let want = slots.len() as u32;
        ring.submit_and_wait(want).expect("submit");

        let mut harvested = 0;
        while harvested < slots.len() {
            harvested += ring.try_completions(&mut out).expect("harvest");
        }
        ops += slots.len() as u64;
    }

    let elapsed = start.elapsed();
    BatchResult {
        batch,
        ops_per_sec: ops as f64 / elapsed.as_secs_f64(),
        ns_per_op: if ops > 0 {
            elapsed.as_nanos() as f64 / ops as f64
        } else {
            0.0
        },
    }
}

// ── Main ────────────────────────────────────────────────────────────

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut seconds = 2u64;
    let mut depth = 256u32;
    let mut sqpoll = false;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--seconds" => {
                i += 1;
                seconds = args[i].parse().expect("--seconds");
            }
            "--depth" => {
                i += 1;
                depth = args[i].parse().expect("--depth");
            }
            "--sqpoll" => {
                sqpoll = true;
            }
            "--verbose" => {
                verbose = true;
            }
            _ => {
                eprintln!("unknown arg: {}", args[i]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .compact()
            .init();
    }

    let duration = Duration::from_secs(seconds);
    let batches: Vec<u32> = [1u32, 8, 32, 128]
        .into_iter()
        .filter(|&b| b <= depth)
        .collect();

    eprintln!("Nop benchmark: depth {depth}, {seconds}s per batch size");
    eprintln!("  batches: {batches:?}");
    eprintln!();

    let mut results = Vec::new();
    for &batch in &batches {
        let ring = Ring::new(depth).expect("ring setup");
        eprintln!("  batch {batch} on a {}-entry ring", ring.entries());
        let result = run_batch(ring, batch, duration);
        eprintln!(
            "    {:>12.0} ops/s  {:>8.0} ns/op",
            result.ops_per_sec, result.ns_per_op
        );
        results.push(("enter", result));
    }

    if sqpoll {
        let config = ConfigBuilder::new()
            .entries(depth)
            .sq_poll(100)
            .build()
            .expect("config");
        match Ring::with_config(&config) {
            Ok(ring) => {
                eprintln!("  batch 32 with submission polling");
                let result = run_batch(ring, 32.min(depth), duration);
                eprintln!(
                    "    {:>12.0} ops/s  {:>8.0} ns/op",
                    result.ops_per_sec, result.ns_per_op
                );
                results.push(("sqpoll", result));
            }
            Err(e) => eprintln!("  sqpoll run skipped: {e}"),
        }
    }

    // ── Summary table ───────────────────────────────────────────────
    eprintln!();
    eprintln!("## Results");
    eprintln!();
    eprintln!("| Mode   | Batch | ops/s        | ns/op    |");
    eprintln!("|--------|-------|--------------|----------|");
    for (mode, result) in &results {
        eprintln!(
            "| {:<6} | {:>5} | {:>12.0} | {:>8.0} |",
            mode, result.batch, result.ops_per_sec, result.ns_per_op
        );
    }
}
