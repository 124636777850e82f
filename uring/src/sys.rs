//! Raw io_uring kernel interface: syscall shims, setup/enter/register
//! constants, and the `#[repr(C)]` structures shared with the kernel.
//!
//! Everything in this module mirrors the kernel ABI bit-for-bit. Struct and
//! field names follow the kernel headers so they can be checked against
//! `<linux/io_uring.h>` directly; the layout tests at the bottom pin the
//! sizes and offsets the rest of the crate depends on.

#![allow(non_camel_case_types)]

use std::io;
use std::os::fd::RawFd;

// ── Syscall shims ───────────────────────────────────────────────────

/// `io_uring_setup(2)`: create a ring, fill `params` with the negotiated
/// geometry, and return the ring file descriptor.
pub fn io_uring_setup(entries: u32, params: &mut io_uring_params) -> io::Result<RawFd> {
    // Safety: params is a valid, writable io_uring_params; the kernel only
    // writes within it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_ulong,
            params as *mut io_uring_params,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as RawFd)
}

/// `io_uring_enter(2)` without the extended-argument form.
///
/// # Safety
/// `fd` must be a live ring fd (or a registered ring index when
/// `IORING_ENTER_REGISTERED_RING` is set), and the ring's mapped memory
/// must remain valid for the duration of the call.
pub unsafe fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> io::Result<u32> {
    unsafe {
        io_uring_enter_arg(
            fd,
            to_submit,
            min_complete,
            flags,
            std::ptr::null(),
            0,
        )
    }
}

/// `io_uring_enter(2)`, six-argument form. With `IORING_ENTER_EXT_ARG`,
/// `arg` points at an [`io_uring_getevents_arg`] and `argsz` is its size;
/// otherwise `arg` is a sigset pointer (unused here, pass null/0).
///
/// # Safety
/// Same as [`io_uring_enter`]; additionally `arg` must be valid for
/// `argsz` bytes when non-null.
pub unsafe fn io_uring_enter_arg(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
    arg: *const libc::c_void,
    argsz: usize,
) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd as libc::c_long,
            to_submit as libc::c_ulong,
            min_complete as libc::c_ulong,
            flags as libc::c_ulong,
            arg,
            argsz as libc::c_ulong,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// `io_uring_register(2)`: the resource-registration multiplexer.
///
/// # Safety
/// `arg` must match the layout the given `opcode` expects and stay valid
/// for the duration of the call.
pub unsafe fn io_uring_register(
    fd: RawFd,
    opcode: u32,
    arg: *const libc::c_void,
    nr_args: u32,
) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd as libc::c_long,
            opcode as libc::c_ulong,
            arg,
            nr_args as libc::c_ulong,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// System page size.
pub fn page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// ── Setup flags (io_uring_params.flags) ─────────────────────────────

pub const IORING_SETUP_IOPOLL: u32 = 1 << 0;
pub const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub const IORING_SETUP_SQ_AFF: u32 = 1 << 2;
pub const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub const IORING_SETUP_CLAMP: u32 = 1 << 4;
pub const IORING_SETUP_ATTACH_WQ: u32 = 1 << 5;
pub const IORING_SETUP_R_DISABLED: u32 = 1 << 6;
pub const IORING_SETUP_SUBMIT_ALL: u32 = 1 << 7;
pub const IORING_SETUP_COOP_TASKRUN: u32 = 1 << 8;
pub const IORING_SETUP_TASKRUN_FLAG: u32 = 1 << 9;
pub const IORING_SETUP_SQE128: u32 = 1 << 10;
pub const IORING_SETUP_CQE32: u32 = 1 << 11;
pub const IORING_SETUP_SINGLE_ISSUER: u32 = 1 << 12;
pub const IORING_SETUP_DEFER_TASKRUN: u32 = 1 << 13;

// ── Features (io_uring_params.features) ─────────────────────────────

pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
pub const IORING_FEAT_NODROP: u32 = 1 << 1;
pub const IORING_FEAT_SUBMIT_STABLE: u32 = 1 << 2;
pub const IORING_FEAT_RW_CUR_POS: u32 = 1 << 3;
pub const IORING_FEAT_CUR_PERSONALITY: u32 = 1 << 4;
pub const IORING_FEAT_FAST_POLL: u32 = 1 << 5;
pub const IORING_FEAT_POLL_32BITS: u32 = 1 << 6;
pub const IORING_FEAT_SQPOLL_NONFIXED: u32 = 1 << 7;
pub const IORING_FEAT_EXT_ARG: u32 = 1 << 8;
pub const IORING_FEAT_NATIVE_WORKERS: u32 = 1 << 9;
pub const IORING_FEAT_RSRC_TAGS: u32 = 1 << 10;
pub const IORING_FEAT_CQE_SKIP: u32 = 1 << 11;
pub const IORING_FEAT_LINKED_FILE: u32 = 1 << 12;

// ── Mmap offsets ────────────────────────────────────────────────────

pub const IORING_OFF_SQ_RING: u64 = 0;
pub const IORING_OFF_CQ_RING: u64 = 0x8000000;
pub const IORING_OFF_SQES: u64 = 0x10000000;

// ── SQ ring flags (written by the kernel into the SQ flags word) ────

pub const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;
pub const IORING_SQ_CQ_OVERFLOW: u32 = 1 << 1;
pub const IORING_SQ_TASKRUN: u32 = 1 << 2;

// ── Enter flags ─────────────────────────────────────────────────────

pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;
pub const IORING_ENTER_SQ_WAIT: u32 = 1 << 2;
pub const IORING_ENTER_EXT_ARG: u32 = 1 << 3;
pub const IORING_ENTER_REGISTERED_RING: u32 = 1 << 4;

// ── Per-SQE flags (io_uring_sqe.flags) ──────────────────────────────

pub const IOSQE_FIXED_FILE: u8 = 1 << 0;
pub const IOSQE_IO_DRAIN: u8 = 1 << 1;
pub const IOSQE_IO_LINK: u8 = 1 << 2;
pub const IOSQE_IO_HARDLINK: u8 = 1 << 3;
pub const IOSQE_ASYNC: u8 = 1 << 4;
pub const IOSQE_BUFFER_SELECT: u8 = 1 << 5;
pub const IOSQE_CQE_SKIP_SUCCESS: u8 = 1 << 6;

// ── CQE flags (io_uring_cqe.flags) ──────────────────────────────────

pub const IORING_CQE_F_BUFFER: u32 = 1 << 0;
pub const IORING_CQE_F_MORE: u32 = 1 << 1;
pub const IORING_CQE_F_SOCK_NONEMPTY: u32 = 1 << 2;
pub const IORING_CQE_F_NOTIF: u32 = 1 << 3;
pub const IORING_CQE_BUFFER_SHIFT: u32 = 16;

// ── Opcodes ─────────────────────────────────────────────────────────

pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READV: u8 = 1;
pub const IORING_OP_WRITEV: u8 = 2;
pub const IORING_OP_FSYNC: u8 = 3;
pub const IORING_OP_READ_FIXED: u8 = 4;
pub const IORING_OP_WRITE_FIXED: u8 = 5;
pub const IORING_OP_POLL_ADD: u8 = 6;
pub const IORING_OP_POLL_REMOVE: u8 = 7;
pub const IORING_OP_SYNC_FILE_RANGE: u8 = 8;
pub const IORING_OP_SENDMSG: u8 = 9;
pub const IORING_OP_RECVMSG: u8 = 10;
pub const IORING_OP_TIMEOUT: u8 = 11;
pub const IORING_OP_TIMEOUT_REMOVE: u8 = 12;
pub const IORING_OP_ACCEPT: u8 = 13;
pub const IORING_OP_ASYNC_CANCEL: u8 = 14;
pub const IORING_OP_LINK_TIMEOUT: u8 = 15;
pub const IORING_OP_CONNECT: u8 = 16;
pub const IORING_OP_FALLOCATE: u8 = 17;
pub const IORING_OP_OPENAT: u8 = 18;
pub const IORING_OP_CLOSE: u8 = 19;
pub const IORING_OP_FILES_UPDATE: u8 = 20;
pub const IORING_OP_STATX: u8 = 21;
pub const IORING_OP_READ: u8 = 22;
pub const IORING_OP_WRITE: u8 = 23;
pub const IORING_OP_FADVISE: u8 = 24;
pub const IORING_OP_MADVISE: u8 = 25;
pub const IORING_OP_SEND: u8 = 26;
pub const IORING_OP_RECV: u8 = 27;
pub const IORING_OP_OPENAT2: u8 = 28;
pub const IORING_OP_EPOLL_CTL: u8 = 29;
pub const IORING_OP_SPLICE: u8 = 30;
pub const IORING_OP_PROVIDE_BUFFERS: u8 = 31;
pub const IORING_OP_REMOVE_BUFFERS: u8 = 32;
pub const IORING_OP_TEE: u8 = 33;
pub const IORING_OP_SHUTDOWN: u8 = 34;
pub const IORING_OP_RENAMEAT: u8 = 35;
pub const IORING_OP_UNLINKAT: u8 = 36;
pub const IORING_OP_MKDIRAT: u8 = 37;
pub const IORING_OP_SYMLINKAT: u8 = 38;
pub const IORING_OP_LINKAT: u8 = 39;
pub const IORING_OP_MSG_RING: u8 = 40;
pub const IORING_OP_FSETXATTR: u8 = 41;
pub const IORING_OP_SETXATTR: u8 = 42;
pub const IORING_OP_FGETXATTR: u8 = 43;
pub const IORING_OP_GETXATTR: u8 = 44;
pub const IORING_OP_SOCKET: u8 = 45;
pub const IORING_OP_URING_CMD: u8 = 46;
pub const IORING_OP_SEND_ZC: u8 = 47;
pub const IORING_OP_SENDMSG_ZC: u8 = 48;

// ── Per-operation modifier bits ─────────────────────────────────────

/// `fsync_flags`: flush data only.
pub const IORING_FSYNC_DATASYNC: u32 = 1 << 0;
/// `timeout_flags`: the timespec is an absolute time.
pub const IORING_TIMEOUT_ABS: u32 = 1 << 0;
/// `poll_events` modifier: multishot poll.
pub const IORING_POLL_ADD_MULTI: u32 = 1 << 0;
/// `ioprio` bit for accept: multishot accept.
pub const IORING_ACCEPT_MULTISHOT: u16 = 1 << 0;
/// `ioprio` bit for send/recv: poll first instead of attempting transfer.
pub const IORING_RECVSEND_POLL_FIRST: u16 = 1 << 0;
/// `ioprio` bit for recv: multishot receive.
pub const IORING_RECV_MULTISHOT: u16 = 1 << 1;
/// `cancel_flags`: cancel all requests matching the key.
pub const IORING_ASYNC_CANCEL_ALL: u32 = 1 << 0;
/// `cancel_flags`: key is a file descriptor, not user_data.
pub const IORING_ASYNC_CANCEL_FD: u32 = 1 << 1;
/// `cancel_flags`: match any request.
pub const IORING_ASYNC_CANCEL_ANY: u32 = 1 << 2;

/// Number of opcode slots a probe reply covers.
pub const PROBE_OPS_LEN: usize = 256;

/// `io_uring_probe_op.flags` bit: the opcode is supported.
pub const IO_URING_OP_SUPPORTED: u16 = 1 << 0;

// ── Register opcodes ────────────────────────────────────────────────

pub const IORING_REGISTER_BUFFERS: u32 = 0;
pub const IORING_UNREGISTER_BUFFERS: u32 = 1;
pub const IORING_REGISTER_FILES: u32 = 2;
pub const IORING_UNREGISTER_FILES: u32 = 3;
pub const IORING_REGISTER_EVENTFD: u32 = 4;
pub const IORING_UNREGISTER_EVENTFD: u32 = 5;
pub const IORING_REGISTER_FILES_UPDATE: u32 = 6;
pub const IORING_REGISTER_EVENTFD_ASYNC: u32 = 7;
pub const IORING_REGISTER_PROBE: u32 = 8;
pub const IORING_REGISTER_PERSONALITY: u32 = 9;
pub const IORING_UNREGISTER_PERSONALITY: u32 = 10;
pub const IORING_REGISTER_RESTRICTIONS: u32 = 11;
pub const IORING_REGISTER_ENABLE_RINGS: u32 = 12;
pub const IORING_REGISTER_FILES2: u32 = 13;
pub const IORING_REGISTER_FILES_UPDATE2: u32 = 14;
pub const IORING_REGISTER_BUFFERS2: u32 = 15;
pub const IORING_REGISTER_BUFFERS_UPDATE: u32 = 16;
pub const IORING_REGISTER_IOWQ_AFF: u32 = 17;
pub const IORING_UNREGISTER_IOWQ_AFF: u32 = 18;
pub const IORING_REGISTER_IOWQ_MAX_WORKERS: u32 = 19;
pub const IORING_REGISTER_RING_FDS: u32 = 20;
pub const IORING_UNREGISTER_RING_FDS: u32 = 21;
pub const IORING_REGISTER_PBUF_RING: u32 = 22;
pub const IORING_UNREGISTER_PBUF_RING: u32 = 23;
pub const IORING_REGISTER_SYNC_CANCEL: u32 = 24;
pub const IORING_REGISTER_FILE_ALLOC_RANGE: u32 = 25;

/// High bit of the register opcode: interpret `fd` as a registered ring
/// index instead of a raw descriptor.
pub const IORING_REGISTER_USE_REGISTERED_RING: u32 = 1 << 31;

/// `io_uring_rsrc_register.flags` bit: allocate a sparse table.
pub const IORING_RSRC_REGISTER_SPARSE: u32 = 1 << 0;

// ── Restriction codes ───────────────────────────────────────────────

pub const IORING_RESTRICTION_REGISTER_OP: u16 = 0;
pub const IORING_RESTRICTION_SQE_OP: u16 = 1;
pub const IORING_RESTRICTION_SQE_FLAGS_ALLOWED: u16 = 2;
pub const IORING_RESTRICTION_SQE_FLAGS_REQUIRED: u16 = 3;

// ── Limits ──────────────────────────────────────────────────────────

/// Kernel ceiling for submission queue entries.
pub const IORING_MAX_ENTRIES: u32 = 32768;
/// Kernel ceiling for completion queue entries.
pub const IORING_MAX_CQ_ENTRIES: u32 = 2 * IORING_MAX_ENTRIES;

/// Bytes of shared ring bookkeeping (head/tail/flags words and padding for
/// both rings) in front of the CQE array, used for locked-memory sizing.
pub const RING_HEADER_SIZE: usize = 320;

// ── Shared structures ───────────────────────────────────────────────

/// Byte offsets of the submission ring's fields within its mapping.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_sqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Byte offsets of the completion ring's fields within its mapping.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_cqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Setup negotiation: userspace fills `flags` (and `sq_thread_*`/`wq_fd`
/// where relevant), the kernel returns entry counts, features, and the
/// ring field offsets.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: io_sqring_offsets,
    pub cq_off: io_cqring_offsets,
}

/// Completion queue entry. In CQE32 mode the kernel appends a further
/// 16 bytes per record; the queue accounts for that with a stride shift.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

/// Argument for `IORING_REGISTER_BUFFERS2` / `IORING_REGISTER_FILES2`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_rsrc_register {
    pub nr: u32,
    pub flags: u32,
    pub resv2: u64,
    pub data: u64,
    pub tags: u64,
}

/// Argument for single-table updates (files update, ring-fd slots).
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_rsrc_update {
    pub offset: u32,
    pub resv: u32,
    pub data: u64,
}

/// Tagged update argument (`*_UPDATE2` register opcodes).
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_rsrc_update2 {
    pub offset: u32,
    pub resv: u32,
    pub data: u64,
    pub tags: u64,
    pub nr: u32,
    pub resv2: u32,
}

/// One opcode's row in a probe reply.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_probe_op {
    pub op: u8,
    pub resv: u8,
    pub flags: u16,
    pub resv2: u32,
}

/// Probe reply header; `ops_len` rows of [`io_uring_probe_op`] follow.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_probe {
    pub last_op: u8,
    pub ops_len: u8,
    pub resv: u16,
    pub resv2: [u32; 3],
}

/// One provided-buffer record in a registered buffer ring.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_buf {
    pub addr: u64,
    pub len: u32,
    pub bid: u16,
    pub resv: u16,
}

/// Argument for `IORING_REGISTER_PBUF_RING`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_buf_reg {
    pub ring_addr: u64,
    pub ring_entries: u32,
    pub bgid: u16,
    pub flags: u16,
    pub resv: [u64; 3],
}

/// 64-bit timespec as the kernel expects it regardless of libc.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct kernel_timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// Extended enter argument (`IORING_ENTER_EXT_ARG`).
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_getevents_arg {
    pub sigmask: u64,
    pub sigmask_sz: u32,
    pub pad: u32,
    pub ts: u64,
}

/// Argument for `IORING_REGISTER_SYNC_CANCEL`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_sync_cancel_reg {
    pub addr: u64,
    pub fd: i32,
    pub flags: u32,
    pub timeout: kernel_timespec,
    pub pad: [u64; 4],
}

/// One restriction row (`IORING_REGISTER_RESTRICTIONS`). `op` is the
/// register-op / sqe-op / sqe-flags union, selected by `opcode`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_restriction {
    pub opcode: u16,
    pub op: u8,
    pub resv: u8,
    pub resv2: [u32; 3],
}

/// Argument for `IORING_REGISTER_FILE_ALLOC_RANGE`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct io_uring_file_index_range {
    pub off: u32,
    pub len: u32,
    pub resv: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn params_layout() {
        assert_eq!(size_of::<io_sqring_offsets>(), 40);
        assert_eq!(size_of::<io_cqring_offsets>(), 40);
        assert_eq!(size_of::<io_uring_params>(), 120);
        assert_eq!(offset_of!(io_uring_params, features), 20);
        assert_eq!(offset_of!(io_uring_params, sq_off), 40);
        assert_eq!(offset_of!(io_uring_params, cq_off), 80);
    }

    #[test]
    fn cqe_layout() {
        assert_eq!(size_of::<io_uring_cqe>(), 16);
        assert_eq!(offset_of!(io_uring_cqe, res), 8);
        assert_eq!(offset_of!(io_uring_cqe, flags), 12);
    }

    #[test]
    fn register_arg_layouts() {
        assert_eq!(size_of::<io_uring_rsrc_register>(), 32);
        assert_eq!(size_of::<io_uring_rsrc_update>(), 16);
        assert_eq!(size_of::<io_uring_rsrc_update2>(), 32);
        assert_eq!(size_of::<io_uring_probe_op>(), 8);
        assert_eq!(size_of::<io_uring_probe>(), 16);
        assert_eq!(size_of::<io_uring_buf>(), 16);
        assert_eq!(size_of::<io_uring_buf_reg>(), 40);
        assert_eq!(size_of::<io_uring_getevents_arg>(), 24);
        assert_eq!(size_of::<io_uring_sync_cancel_reg>(), 64);
        assert_eq!(size_of::<io_uring_restriction>(), 16);
        assert_eq!(size_of::<io_uring_file_index_range>(), 16);
    }

    #[test]
    fn page_size_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }
}
