//! The submission descriptor and its operation encoders.
//!
//! [`Sqe`] is the 64-byte wire record the kernel consumes. The kernel header
//! overlays several unions on it; here it is one fixed-layout struct where
//! each offset has a single field, and the alternate interpretations go
//! through named accessors instead of a Rust union or enum. The `prep_*`
//! methods are the operation catalog: each fills the fields one operation
//! needs and leaves the rest as the zeroes slot acquisition put there.
//!
//! Encoders that embed a raw pointer are `unsafe fn`: the kernel may read
//! or write through that pointer any time between submission and the
//! operation's completion record being dequeued, so the memory must stay
//! valid and unaliased for that whole window.

use std::os::fd::RawFd;

use crate::sys;

/// A raw file descriptor for operation encoding.
///
/// Carries the conventional `-1` invalid sentinel; nothing converts
/// implicitly, extraction is [`raw`](Self::raw).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(pub RawFd);

impl Fd {
    pub const INVALID: Fd = Fd(-1);

    #[inline]
    pub fn raw(self) -> RawFd {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// An index into the registered (fixed) file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed(pub u32);

impl Fixed {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// One submission queue entry, laid out exactly as the kernel ABI fixes it.
///
/// Field meaning varies by opcode: `off` doubles as `addr2`/`cmd_op`,
/// `addr` as `splice_off_in`, `op_flags` as the per-operation flag word
/// (`rw_flags`, `fsync_flags`, `poll32_events`, `msg_flags`, ...),
/// `buf_index` as `buf_group`, and `splice_fd_in` as `file_index`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Sqe {
    opcode: u8,
    flags: u8,
    ioprio: u16,
    fd: i32,
    off: u64,
    addr: u64,
    len: u32,
    op_flags: u32,
    user_data: u64,
    buf_index: u16,
    personality: u16,
    splice_fd_in: i32,
    addr3: u64,
    __pad2: u64,
}

impl Sqe {
    // ── Field accessors ─────────────────────────────────────────────

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    #[inline]
    pub fn sqe_flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub fn off(&self) -> u64 {
        self.off
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn op_flags(&self) -> u32 {
        self.op_flags
    }

    #[inline]
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// The `buf_index`/`buf_group` union word.
    #[inline]
    pub fn buf_index(&self) -> u16 {
        self.buf_index
    }

    #[inline]
    pub fn set_user_data(&mut self, user_data: u64) {
        self.user_data = user_data;
    }

    #[inline]
    pub fn set_personality(&mut self, personality: u16) {
        self.personality = personality;
    }

    #[inline]
    pub fn set_ioprio(&mut self, ioprio: u16) {
        self.ioprio = ioprio;
    }

    // ── Slot flags ──────────────────────────────────────────────────

    /// Chain the next descriptor to this one; it starts only after this
    /// one completes successfully.
    #[inline]
    pub fn set_link(&mut self) {
        self.flags |= sys::IOSQE_IO_LINK;
    }

    /// Like [`set_link`](Self::set_link), but the chain survives an error
    /// result.
    #[inline]
    pub fn set_hardlink(&mut self) {
        self.flags |= sys::IOSQE_IO_HARDLINK;
    }

    /// Wait for all prior descriptors to complete before starting.
    #[inline]
    pub fn set_drain(&mut self) {
        self.flags |= sys::IOSQE_IO_DRAIN;
    }

    /// Skip the inline-attempt fast path and go straight to async.
    #[inline]
    pub fn set_async(&mut self) {
        self.flags |= sys::IOSQE_ASYNC;
    }

    /// Suppress the completion record if the operation succeeds.
    #[inline]
    pub fn set_skip_success(&mut self) {
        self.flags |= sys::IOSQE_CQE_SKIP_SUCCESS;
    }

    /// Address the target by fixed-file table index instead of the raw fd
    /// an encoder stored. Overwrites the fd field.
    #[inline]
    pub fn use_fixed_file(&mut self, index: Fixed) {
        self.fd = index.raw() as i32;
        self.flags |= sys::IOSQE_FIXED_FILE;
    }

    /// Have the kernel pick the operation's buffer from a registered group.
    #[inline]
    pub fn select_from_group(&mut self, group: u16) {
        self.buf_index = group;
        self.flags |= sys::IOSQE_BUFFER_SELECT;
    }

    // ── Operation encoders ──────────────────────────────────────────

    /// No-op: completes immediately with result 0.
    pub fn prep_nop(&mut self, user_data: u64) {
        self.opcode = sys::IORING_OP_NOP;
        self.fd = -1;
        self.user_data = user_data;
    }

    /// Read up to `len` bytes into `buf` at file `offset`.
    ///
    /// # Safety
    /// `buf` must stay valid and exclusively writable until the matching
    /// completion is dequeued.
    pub unsafe fn prep_read(&mut self, fd: Fd, buf: *mut u8, len: u32, offset: u64, user_data: u64) {
        self.opcode = sys::IORING_OP_READ;
        self.fd = fd.raw();
        self.addr = buf as u64;
        self.len = len;
        self.off = offset;
        self.user_data = user_data;
    }

    /// Write `len` bytes from `buf` at file `offset`.
    ///
    /// # Safety
    /// `buf` must stay valid until the matching completion is dequeued.
    pub unsafe fn prep_write(
        &mut self,
        fd: Fd,
        buf: *const u8,
        len: u32,
        offset: u64,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_WRITE;
        self.fd = fd.raw();
        self.addr = buf as u64;
        self.len = len;
        self.off = offset;
        self.user_data = user_data;
    }

    /// Vectored read.
    ///
    /// # Safety
    /// The iovec array and every buffer it points at must stay valid until
    /// completion.
    pub unsafe fn prep_readv(
        &mut self,
        fd: Fd,
        iovecs: *const libc::iovec,
        nr_vecs: u32,
        offset: u64,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_READV;
        self.fd = fd.raw();
        self.addr = iovecs as u64;
        self.len = nr_vecs;
        self.off = offset;
        self.user_data = user_data;
    }

    /// Vectored write.
    ///
    /// # Safety
    /// As [`prep_readv`](Self::prep_readv).
    pub unsafe fn prep_writev(
        &mut self,
        fd: Fd,
        iovecs: *const libc::iovec,
        nr_vecs: u32,
        offset: u64,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_WRITEV;
        self.fd = fd.raw();
        self.addr = iovecs as u64;
        self.len = nr_vecs;
        self.off = offset;
        self.user_data = user_data;
    }

    /// Read into a registered buffer (`buf_index` into the table from
    /// buffer registration).
    ///
    /// # Safety
    /// `buf` must lie within the registered buffer at `buf_index` and stay
    /// registered until completion.
    pub unsafe fn prep_read_fixed(
        &mut self,
        fd: Fd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        buf_index: u16,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_READ_FIXED;
        self.fd = fd.raw();
        self.addr = buf as u64;
        self.len = len;
        self.off = offset;
        self.buf_index = buf_index;
        self.user_data = user_data;
    }

    /// Write from a registered buffer.
    ///
    /// # Safety
    /// As [`prep_read_fixed`](Self::prep_read_fixed).
    pub unsafe fn prep_write_fixed(
        &mut self,
        fd: Fd,
        buf: *const u8,
        len: u32,
        offset: u64,
        buf_index: u16,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_WRITE_FIXED;
        self.fd = fd.raw();
        self.addr = buf as u64;
        self.len = len;
        self.off = offset;
        self.buf_index = buf_index;
        self.user_data = user_data;
    }

    /// Read with the buffer chosen by the kernel from a registered group;
    /// the completion flags carry the chosen buffer id.
    pub fn prep_read_select(&mut self, fd: Fd, group: u16, len: u32, offset: u64, user_data: u64) {
        self.opcode = sys::IORING_OP_READ;
        self.fd = fd.raw();
        self.len = len;
        self.off = offset;
        self.user_data = user_data;
        self.select_from_group(group);
    }

    /// Socket receive.
    ///
    /// # Safety
    /// `buf` must stay valid and exclusively writable until completion.
    pub unsafe fn prep_recv(&mut self, fd: Fd, buf: *mut u8, len: u32, flags: u32, user_data: u64) {
        self.opcode = sys::IORING_OP_RECV;
        self.fd = fd.raw();
        self.addr = buf as u64;
        self.len = len;
        self.op_flags = flags;
        self.user_data = user_data;
    }

    /// Receive into a kernel-selected buffer from a registered group.
    pub fn prep_recv_select(&mut self, fd: Fd, group: u16, len: u32, flags: u32, user_data: u64) {
        self.opcode = sys::IORING_OP_RECV;
        self.fd = fd.raw();
        self.len = len;
        self.op_flags = flags;
        self.user_data = user_data;
        self.select_from_group(group);
    }

    /// Multishot receive from a registered group: one submission, a
    /// completion per datagram/segment, each flagged with its buffer id
    /// and "more" until the kernel stops the series.
    pub fn prep_recv_multishot(&mut self, fd: Fd, group: u16, flags: u32, user_data: u64) {
        self.prep_recv_select(fd, group, 0, flags, user_data);
        self.ioprio |= sys::IORING_RECV_MULTISHOT;
    }

    /// Socket send.
    ///
    /// # Safety
    /// `buf` must stay valid until completion.
    pub unsafe fn prep_send(
        &mut self,
        fd: Fd,
        buf: *const u8,
        len: u32,
        flags: u32,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_SEND;
        self.fd = fd.raw();
        self.addr = buf as u64;
        self.len = len;
        self.op_flags = flags;
        self.user_data = user_data;
    }

    /// Accept a connection.
    ///
    /// # Safety
    /// `addr`/`addrlen`, when non-null, must stay valid and exclusively
    /// writable until completion.
    pub unsafe fn prep_accept(
        &mut self,
        fd: Fd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: u32,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_ACCEPT;
        self.fd = fd.raw();
        self.addr = addr as u64;
        self.off = addrlen as u64;
        self.op_flags = flags;
        self.user_data = user_data;
    }

    /// Connect a socket.
    ///
    /// # Safety
    /// `addr` must stay valid until completion.
    pub unsafe fn prep_connect(
        &mut self,
        fd: Fd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_CONNECT;
        self.fd = fd.raw();
        self.addr = addr as u64;
        self.off = addrlen as u64;
        self.user_data = user_data;
    }

    /// Flush a file's data (and metadata unless `datasync`).
    pub fn prep_fsync(&mut self, fd: Fd, datasync: bool, user_data: u64) {
        self.opcode = sys::IORING_OP_FSYNC;
        self.fd = fd.raw();
        if datasync {
            self.op_flags = sys::IORING_FSYNC_DATASYNC;
        }
        self.user_data = user_data;
    }

    /// Close a descriptor.
    pub fn prep_close(&mut self, fd: Fd, user_data: u64) {
        self.opcode = sys::IORING_OP_CLOSE;
        self.fd = fd.raw();
        self.user_data = user_data;
    }

    /// One-shot poll readiness.
    pub fn prep_poll_add(&mut self, fd: Fd, events: u32, user_data: u64) {
        self.opcode = sys::IORING_OP_POLL_ADD;
        self.fd = fd.raw();
        self.op_flags = events;
        self.user_data = user_data;
    }

    /// Remove a pending poll by its correlation tag.
    pub fn prep_poll_remove(&mut self, target_user_data: u64, user_data: u64) {
        self.opcode = sys::IORING_OP_POLL_REMOVE;
        self.fd = -1;
        self.addr = target_user_data;
        self.user_data = user_data;
    }

    /// Arm a timeout; completes with `-ETIME` on expiry or 0 when `count`
    /// completions arrive first.
    ///
    /// # Safety
    /// `ts` must stay valid until the timeout completes or is removed.
    pub unsafe fn prep_timeout(
        &mut self,
        ts: *const sys::kernel_timespec,
        count: u32,
        flags: u32,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_TIMEOUT;
        self.fd = -1;
        self.addr = ts as u64;
        self.len = 1;
        self.off = count as u64;
        self.op_flags = flags;
        self.user_data = user_data;
    }

    /// Timeout bound to the preceding linked operation.
    ///
    /// # Safety
    /// As [`prep_timeout`](Self::prep_timeout).
    pub unsafe fn prep_link_timeout(
        &mut self,
        ts: *const sys::kernel_timespec,
        flags: u32,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_LINK_TIMEOUT;
        self.fd = -1;
        self.addr = ts as u64;
        self.len = 1;
        self.op_flags = flags;
        self.user_data = user_data;
    }

    /// Cancel an in-flight operation by its correlation tag.
    pub fn prep_async_cancel(&mut self, target_user_data: u64, flags: u32, user_data: u64) {
        self.opcode = sys::IORING_OP_ASYNC_CANCEL;
        self.fd = -1;
        self.addr = target_user_data;
        self.op_flags = flags;
        self.user_data = user_data;
    }

    /// Hand `nbufs` buffers of `buf_len` bytes starting at `base` to the
    /// kernel as group `group`, ids starting at `start_bid`.
    ///
    /// # Safety
    /// The backing memory must stay valid while the kernel may still hand
    /// out or write into these buffers.
    pub unsafe fn prep_provide_buffers(
        &mut self,
        base: *mut u8,
        buf_len: u32,
        nbufs: u16,
        group: u16,
        start_bid: u16,
        user_data: u64,
    ) {
        self.opcode = sys::IORING_OP_PROVIDE_BUFFERS;
        self.fd = nbufs as i32;
        self.addr = base as u64;
        self.len = buf_len;
        self.off = start_bid as u64;
        self.buf_index = group;
        self.user_data = user_data;
    }

    /// Take `nbufs` buffers back out of group `group`.
    pub fn prep_remove_buffers(&mut self, nbufs: u16, group: u16, user_data: u64) {
        self.opcode = sys::IORING_OP_REMOVE_BUFFERS;
        self.fd = nbufs as i32;
        self.buf_index = group;
        self.user_data = user_data;
    }

    /// Shut down a socket (`how` as for `shutdown(2)`).
    pub fn prep_shutdown(&mut self, fd: Fd, how: i32, user_data: u64) {
        self.opcode = sys::IORING_OP_SHUTDOWN;
        self.fd = fd.raw();
        self.len = how as u32;
        self.user_data = user_data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    fn as_bytes(sqe: &Sqe) -> [u8; 64] {
        // Safety: Sqe is a 64-byte repr(C) POD.
        unsafe { std::mem::transmute(*sqe) }
    }

    #[test]
    fn layout_is_kernel_abi() {
        assert_eq!(size_of::<Sqe>(), 64);
        assert_eq!(offset_of!(Sqe, fd), 4);
        assert_eq!(offset_of!(Sqe, off), 8);
        assert_eq!(offset_of!(Sqe, addr), 16);
        assert_eq!(offset_of!(Sqe, len), 24);
        assert_eq!(offset_of!(Sqe, op_flags), 28);
        assert_eq!(offset_of!(Sqe, user_data), 32);
        assert_eq!(offset_of!(Sqe, buf_index), 40);
        assert_eq!(offset_of!(Sqe, personality), 42);
        assert_eq!(offset_of!(Sqe, splice_fd_in), 44);
        assert_eq!(offset_of!(Sqe, addr3), 48);
    }

    #[test]
    fn nop_encoding_is_byte_exact() {
        let mut sqe = Sqe::default();
        sqe.prep_nop(2023);

        assert_eq!(sqe.opcode(), sys::IORING_OP_NOP);
        assert_eq!(sqe.fd(), -1);
        assert_eq!(sqe.user_data(), 2023);

        let bytes = as_bytes(&sqe);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[4..8], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[32..40], &2023u64.to_le_bytes());
        for (i, b) in bytes.iter().enumerate() {
            if !(i == 0 || (4..8).contains(&i) || (32..40).contains(&i)) {
                assert_eq!(*b, 0, "byte {i} should be zero");
            }
        }
    }

    #[test]
    fn read_encoding() {
        let mut sqe = Sqe::default();
        let mut buf = [0u8; 512];
        unsafe {
            sqe.prep_read(Fd(7), buf.as_mut_ptr(), 512, 4096, 99);
        }
        assert_eq!(sqe.opcode(), sys::IORING_OP_READ);
        assert_eq!(sqe.fd(), 7);
        assert_eq!(sqe.addr(), buf.as_mut_ptr() as u64);
        assert_eq!(sqe.len(), 512);
        assert_eq!(sqe.off(), 4096);
        assert_eq!(sqe.user_data(), 99);
    }

    #[test]
    fn provide_buffers_encoding() {
        let mut sqe = Sqe::default();
        unsafe {
            sqe.prep_provide_buffers(0x4000 as *mut u8, 1024, 16, 3, 1, 0);
        }
        assert_eq!(sqe.opcode(), sys::IORING_OP_PROVIDE_BUFFERS);
        assert_eq!(sqe.fd(), 16);
        assert_eq!(sqe.len(), 1024);
        assert_eq!(sqe.off(), 1);
        assert_eq!(sqe.buf_index(), 3);
    }

    #[test]
    fn select_sets_group_and_flag() {
        let mut sqe = Sqe::default();
        sqe.prep_read_select(Fd(5), 9, 4096, 0, 1);
        assert_eq!(sqe.buf_index(), 9);
        assert!(sqe.sqe_flags() & sys::IOSQE_BUFFER_SELECT != 0);
    }

    #[test]
    fn link_and_fixed_file() {
        let mut sqe = Sqe::default();
        sqe.prep_fsync(Fd(3), false, 0);
        sqe.set_link();
        sqe.use_fixed_file(Fixed(2));
        assert_eq!(sqe.fd(), 2);
        assert!(sqe.sqe_flags() & sys::IOSQE_IO_LINK != 0);
        assert!(sqe.sqe_flags() & sys::IOSQE_FIXED_FILE != 0);
    }

    #[test]
    fn fd_sentinel() {
        assert!(!Fd::INVALID.is_valid());
        assert_eq!(Fd::INVALID.raw(), -1);
        assert!(Fd(0).is_valid());
    }
}
