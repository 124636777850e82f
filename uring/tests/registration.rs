//! Integration tests: resource registration against a real kernel ring.
//!
//! Buffer groups, buffer rings, fixed files, eventfd, probe, personality,
//! and the registered ring-fd fast path. Tests that need opcodes newer
//! than the running kernel skip themselves.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use uring::{Fd, Fixed, Ring, sys};

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if io_uring is supported on this kernel.
fn io_uring_supported() -> bool {
    // EFAULT (bad params pointer) means the syscall exists; ENOSYS means it doesn't.
    let ret = unsafe { libc::syscall(libc::SYS_io_uring_setup, 1u32, std::ptr::null_mut::<u8>()) };
    ret != -1 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ENOSYS)
}

/// Temp file path in the current directory (tmpfs may reject O_DIRECT).
fn temp_file_path(name: &str) -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(name)
}

fn opcode_supported(ring: &mut Ring, opcode: u8) -> bool {
    match ring.probe() {
        Ok(probe) => probe.is_supported(opcode),
        Err(_) => false,
    }
}

// ── Buffer groups ───────────────────────────────────────────────────

#[test]
fn unregister_absent_buffer_group_is_a_noop() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");
    ring.unregister_buffer_group(42).expect("unregister");
    assert!(ring.buffer_group(42).is_none());
}

#[test]
fn buffer_group_register_round_trip() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(8).expect("ring setup");
    if !opcode_supported(&mut ring, sys::IORING_OP_PROVIDE_BUFFERS) {
        eprintln!("SKIP: kernel lacks provided buffers");
        return;
    }

    ring.register_buffer_group(1, 5, 1000).expect("register");
    let group = ring.buffer_group(1).expect("group");
    assert_eq!(group.buffer_count(), 8);
    assert_eq!(group.buf_size(), 1024);

    // A second registration under the same id is refused while the first
    // is live.
    assert!(ring.register_buffer_group(1, 4, 512).is_err());

    ring.unregister_buffer_group(1).expect("unregister");
    assert!(ring.buffer_group(1).is_none());
    ring.unregister_buffer_group(1).expect("unregister absent");
}

#[test]
fn buffer_select_read_reports_the_buffer_id() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(8).expect("ring setup");
    if !opcode_supported(&mut ring, sys::IORING_OP_PROVIDE_BUFFERS) {
        eprintln!("SKIP: kernel lacks provided buffers");
        return;
    }

    let path = temp_file_path(".uring_select_read");
    let payload = b"selected buffer payload";
    fs::write(&path, payload).expect("write temp file");
    let file = fs::File::open(&path).expect("open");
    let fd = Fd(file.as_raw_fd());

    ring.register_buffer_group(7, 4, 4096).expect("register");

    let slot = ring.try_slot().expect("slot");
    ring.prepare(slot, |sqe| sqe.prep_read_select(fd, 7, 4096, 0, 5));
    ring.submit_and_wait(1).expect("submit");

    let completion = ring.try_completion().expect("completion");
    assert_eq!(completion.user_data(), 5);
    let n = completion.io_result().expect("read") as usize;
    assert_eq!(n, payload.len());

    let bid = completion.buffer_id().expect("buffer id");
    let group = ring.buffer_group(7).expect("group");
    let (ptr, len) = group.buffer(bid);
    assert!(len as usize >= n);
    let got = unsafe { std::slice::from_raw_parts(ptr, n) };
    assert_eq!(got, payload);

    drop(file);
    let _ = fs::remove_file(&path);
}

// ── Buffer rings ────────────────────────────────────────────────────

#[test]
fn unregister_absent_buffer_ring_is_a_noop() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");
    ring.unregister_buffer_ring(9).expect("unregister");
    assert!(ring.buffer_ring(9).is_none());
}

#[test]
fn buffer_ring_register_replace_unregister() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(8).expect("ring setup");
    if ring.register_buffer_ring(3, 8, 4096).is_err() {
        eprintln!("SKIP: kernel lacks mapped buffer rings");
        return;
    }
    assert_eq!(ring.buffer_ring(3).expect("ring").entries(), 8);

    // Re-registering the same group swaps in a fresh ring.
    ring.register_buffer_ring(3, 16, 2048).expect("replace");
    let buf_ring = ring.buffer_ring(3).expect("ring");
    assert_eq!(buf_ring.entries(), 16);
    assert_eq!(buf_ring.buf_size(), 2048);

    ring.unregister_buffer_ring(3).expect("unregister");
    assert!(ring.buffer_ring(3).is_none());
}

// ── Fixed buffers and files ─────────────────────────────────────────

#[test]
fn registered_buffer_write_round_trip() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");

    let mut backing = vec![0u8; 4096];
    let payload = b"fixed buffer contents";
    backing[..payload.len()].copy_from_slice(payload);
    let iov = libc::iovec {
        iov_base: backing.as_mut_ptr() as *mut libc::c_void,
        iov_len: backing.len(),
    };
    unsafe { ring.register_buffers(&[iov]) }.expect("register buffers");

    let path = temp_file_path(".uring_fixed_buf");
    let file = fs::File::create(&path).expect("create");
    let fd = Fd(file.as_raw_fd());

    let slot = ring.try_slot().expect("slot");
    let base = backing.as_ptr();
    ring.prepare(slot, |sqe| unsafe {
        sqe.prep_write_fixed(fd, base, payload.len() as u32, 0, 0, 1);
    });
    ring.submit_and_wait(1).expect("submit");
    let completion = ring.try_completion().expect("completion");
    assert_eq!(completion.io_result().expect("write"), payload.len() as u32);

    drop(file);
    assert_eq!(fs::read(&path).expect("read back"), payload);

    ring.unregister_buffers().expect("unregister");
    let _ = fs::remove_file(&path);
}

#[test]
fn fixed_file_table_register_update_unregister() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");

    let path_a = temp_file_path(".uring_fixed_a");
    let path_b = temp_file_path(".uring_fixed_b");
    let file_a = fs::File::create(&path_a).expect("create a");
    let file_b = fs::File::create(&path_b).expect("create b");

    ring.register_files(&[file_a.as_raw_fd(), file_a.as_raw_fd()])
        .expect("register");

    // Point table slot 1 at the second file, then write through it.
    let replaced = ring
        .update_files(1, &[file_b.as_raw_fd()])
        .expect("update");
    assert_eq!(replaced, 1);

    let payload = b"through the fixed table";
    let slot = ring.try_slot().expect("slot");
    let base = payload.as_ptr();
    ring.prepare(slot, |sqe| {
        unsafe { sqe.prep_write(Fd(-1), base, payload.len() as u32, 0, 9) };
        sqe.use_fixed_file(Fixed(1));
    });
    ring.submit_and_wait(1).expect("submit");
    let completion = ring.try_completion().expect("completion");
    assert_eq!(completion.io_result().expect("write"), payload.len() as u32);

    ring.unregister_files().expect("unregister");

    drop(file_a);
    drop(file_b);
    assert_eq!(fs::read(&path_b).expect("read back"), payload);
    let _ = fs::remove_file(&path_a);
    let _ = fs::remove_file(&path_b);
}

#[test]
fn sparse_register_raises_the_descriptor_limit_once() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");

    // Sparse tables need a newer kernel; check support before touching
    // rlimits so an unsupported-kernel error cannot be mistaken for the
    // limit path.
    if ring.register_files_sparse(4).is_err() {
        eprintln!("SKIP: kernel lacks sparse fixed-file tables");
        return;
    }
    ring.unregister_files().expect("unregister support-check table");

    let mut original = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(
        unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut original) },
        0
    );
    if original.rlim_max < 256 {
        eprintln!("SKIP: hard descriptor limit too low to exercise the raise");
        return;
    }
    let lowered = libc::rlimit {
        rlim_cur: 64,
        rlim_max: original.rlim_max,
    };
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);

    // Table slots are charged against RLIMIT_NOFILE, so 128 slots exceed
    // the lowered soft limit; the register path must raise it and retry
    // instead of surfacing the rejection.
    let registered = ring.register_files_sparse(128);
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &original) }, 0);
    registered.expect("sparse registration after the raise");
    ring.unregister_files().expect("unregister");
}

// ── Eventfd ─────────────────────────────────────────────────────────

#[test]
fn eventfd_signals_when_a_completion_posts() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");

    let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    assert!(event_fd >= 0, "eventfd: {}", std::io::Error::last_os_error());
    ring.register_eventfd(event_fd).expect("register");

    let slot = ring.try_slot().expect("slot");
    ring.prepare(slot, |sqe| sqe.prep_nop(1));
    ring.submit_and_wait(1).expect("submit");
    assert_eq!(ring.try_completion().expect("completion").user_data(), 1);

    let mut count = 0u64;
    let mut signalled = false;
    for _ in 0..100 {
        let n = unsafe {
            libc::read(
                event_fd,
                &mut count as *mut u64 as *mut libc::c_void,
                size_of::<u64>(),
            )
        };
        if n == size_of::<u64>() as isize {
            signalled = true;
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(signalled, "eventfd never signalled");
    assert!(count >= 1);

    ring.unregister_eventfd().expect("unregister");
    unsafe { libc::close(event_fd) };
}

// ── Probe ───────────────────────────────────────────────────────────

#[test]
fn probe_reports_nop_support() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");
    let probe = match ring.probe() {
        Ok(probe) => probe,
        Err(_) => {
            eprintln!("SKIP: kernel lacks the probe registration");
            return;
        }
    };
    assert!(probe.is_supported(sys::IORING_OP_NOP));
    assert!(probe.is_supported(sys::IORING_OP_READV));
    assert!(!probe.is_supported(255));
}

// ── Personality ─────────────────────────────────────────────────────

#[test]
fn personality_register_round_trip() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");
    let id = match ring.register_personality() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("SKIP: kernel lacks personality registration");
            return;
        }
    };
    ring.unregister_personality(id).expect("unregister");
}

// ── Registered ring fd ──────────────────────────────────────────────

#[test]
fn registered_ring_fd_still_submits() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");
    if ring.register_ring_fd().is_err() {
        eprintln!("SKIP: kernel lacks ring fd registration");
        return;
    }

    // Enter now goes through the registered index.
    let slot = ring.try_slot().expect("slot");
    ring.prepare(slot, |sqe| sqe.prep_nop(21));
    ring.submit_and_wait(1).expect("submit");
    assert_eq!(ring.try_completion().expect("completion").user_data(), 21);

    ring.unregister_ring_fd().expect("unregister");

    // And back through the real fd afterwards.
    let slot = ring.try_slot().expect("slot");
    ring.prepare(slot, |sqe| sqe.prep_nop(22));
    ring.submit_and_wait(1).expect("submit");
    assert_eq!(ring.try_completion().expect("completion").user_data(), 22);
}

// ── io-wq tuning ────────────────────────────────────────────────────

#[test]
fn iowq_max_workers_reports_previous_caps() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let mut ring = Ring::new(4).expect("ring setup");
    // Zeroes query without changing anything.
    let mut counts = [0u32, 0u32];
    if ring.register_iowq_max_workers(&mut counts).is_err() {
        eprintln!("SKIP: kernel lacks io-wq worker caps");
        return;
    }
    assert!(counts[0] > 0 || counts[1] > 0);
}
