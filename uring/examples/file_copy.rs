//! Copy a file through the ring: read a block, write it back out, fsync
//! at the end. One operation in flight at a time, so the slot/submit/
//! completion cycle is easy to follow.
//!
//! Usage:
//!   cargo run -p uring --example file_copy -- <src> <dst> [--block <bytes>]

use std::fs;
use std::os::fd::AsRawFd;

use uring::{Fd, Ring};

/// Submit the one prepared operation and wait for its result.
fn complete_one(ring: &mut Ring, what: &str) -> u32 {
    ring.submit_and_wait(1).expect("submit");
    let completion = ring.try_completion().expect("completion");
    match completion.io_result() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("{what} failed: {e}");
            std::process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut paths = Vec::new();
    let mut block = 64 * 1024usize;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--block" => {
                i += 1;
                block = args[i].parse().expect("--block");
            }
            other => paths.push(other.to_string()),
        }
        i += 1;
    }
    if paths.len() != 2 {
        eprintln!("usage: file_copy <src> <dst> [--block <bytes>]");
        std::process::exit(1);
    }

    let src = fs::File::open(&paths[0]).expect("open source");
    let dst = fs::File::create(&paths[1]).expect("create destination");
    let src_fd = Fd(src.as_raw_fd());
    let dst_fd = Fd(dst.as_raw_fd());

    let mut ring = Ring::new(8).expect("ring setup");
    let mut buf = vec![0u8; block.max(1)];
    let mut offset = 0u64;

    loop {
        let slot = ring.try_slot().expect("slot");
        let base = buf.as_mut_ptr();
        let len = buf.len() as u32;
        ring.prepare(slot, |sqe| unsafe {
            sqe.prep_read(src_fd, base, len, offset, 1);
        });
        let n = complete_one(&mut ring, "read") as usize;
        if n == 0 {
            break;
        }

        // Short writes resume from where they stopped.
        let mut written = 0usize;
        while written < n {
            let slot = ring.try_slot().expect("slot");
            let base = buf[written..].as_ptr();
            let len = (n - written) as u32;
            let at = offset + written as u64;
            ring.prepare(slot, |sqe| unsafe {
                sqe.prep_write(dst_fd, base, len, at, 2);
            });
            written += complete_one(&mut ring, "write") as usize;
        }
        offset += n as u64;
    }

    let slot = ring.try_slot().expect("slot");
    ring.prepare(slot, |sqe| sqe.prep_fsync(dst_fd, false, 3));
    complete_one(&mut ring, "fsync");

    eprintln!("copied {offset} bytes from {} to {}", paths[0], paths[1]);
}
