//! Resource registration.
//!
//! Everything funnels through one `do_register` call that switches to the
//! registered-ring fast path once the ring fd itself has been registered.
//! Buffer groups are the exception: provide/remove-buffers are ordinary
//! operations and travel through the submission queue like any other,
//! with the ring waiting synchronously on their completions.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::{BufferGroup, BufferRing};
use crate::error::{Error, Result};
use crate::metrics;
use crate::probe::RingProbe;
use crate::ring::{REGISTRATION_TAG, Ring};
use crate::sys;

/// One attempt to lift `RLIMIT_NOFILE` by `extra` descriptors, capped at
/// the hard limit.
fn raise_nofile_limit(extra: u64) -> io::Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    limit.rlim_cur = limit.rlim_cur.saturating_add(extra).min(limit.rlim_max);
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Ring {
    pub(crate) fn do_register(
        &mut self,
        opcode: u32,
        arg: *const libc::c_void,
        nr_args: u32,
    ) -> Result<u32> {
        metrics::REGISTER_CALLS.increment();
        let (fd, opcode) = match self.registered_index() {
            Some(index) => (
                index as RawFd,
                opcode | sys::IORING_REGISTER_USE_REGISTERED_RING,
            ),
            None => (self.fd(), opcode),
        };
        unsafe { sys::io_uring_register(fd, opcode, arg, nr_args) }.map_err(Error::Register)
    }

    // ── Fixed buffers ───────────────────────────────────────────────

    /// Registers fixed I/O buffers for `read_fixed`/`write_fixed`.
    ///
    /// # Safety
    /// Every iovec must point at memory that stays valid until the buffers
    /// are unregistered or the ring is dropped.
    pub unsafe fn register_buffers(&mut self, bufs: &[libc::iovec]) -> Result<()> {
        self.do_register(
            sys::IORING_REGISTER_BUFFERS,
            bufs.as_ptr() as *const libc::c_void,
            bufs.len() as u32,
        )?;
        Ok(())
    }

    /// Registers fixed buffers with a resource tag per buffer; the kernel
    /// posts a tagged completion when a replaced buffer is released.
    ///
    /// # Safety
    /// As [`register_buffers`](Self::register_buffers).
    pub unsafe fn register_buffers_tagged(
        &mut self,
        bufs: &[libc::iovec],
        tags: &[u64],
    ) -> Result<()> {
        if bufs.len() != tags.len() {
            return Err(Error::Config(
                "buffer and tag counts must match".to_string(),
            ));
        }
        let reg = sys::io_uring_rsrc_register {
            nr: bufs.len() as u32,
            data: bufs.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            ..Default::default()
        };
        self.do_register(
            sys::IORING_REGISTER_BUFFERS2,
            &reg as *const sys::io_uring_rsrc_register as *const libc::c_void,
            size_of::<sys::io_uring_rsrc_register>() as u32,
        )?;
        Ok(())
    }

    /// Reserves `count` empty fixed-buffer table slots for later updates.
    pub fn register_buffers_sparse(&mut self, count: u32) -> Result<()> {
        let reg = sys::io_uring_rsrc_register {
            nr: count,
            flags: sys::IORING_RSRC_REGISTER_SPARSE,
            ..Default::default()
        };
        self.do_register(
            sys::IORING_REGISTER_BUFFERS2,
            &reg as *const sys::io_uring_rsrc_register as *const libc::c_void,
            size_of::<sys::io_uring_rsrc_register>() as u32,
        )?;
        Ok(())
    }

    /// Replaces fixed-buffer table entries starting at `offset`, tagging
    /// each replacement. Returns how many were updated.
    ///
    /// # Safety
    /// As [`register_buffers`](Self::register_buffers).
    pub unsafe fn update_buffers(
        &mut self,
        offset: u32,
        bufs: &[libc::iovec],
        tags: &[u64],
    ) -> Result<u32> {
        if bufs.len() != tags.len() {
            return Err(Error::Config(
                "buffer and tag counts must match".to_string(),
            ));
        }
        let update = sys::io_uring_rsrc_update2 {
            offset,
            data: bufs.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            nr: bufs.len() as u32,
            ..Default::default()
        };
        self.do_register(
            sys::IORING_REGISTER_BUFFERS_UPDATE,
            &update as *const sys::io_uring_rsrc_update2 as *const libc::c_void,
            size_of::<sys::io_uring_rsrc_update2>() as u32,
        )
    }

    pub fn unregister_buffers(&mut self) -> Result<()> {
        self.do_register(sys::IORING_UNREGISTER_BUFFERS, std::ptr::null(), 0)?;
        Ok(())
    }

    // ── Fixed files ─────────────────────────────────────────────────

    /// Runs one fixed-file registration attempt; on a too-many-open-files
    /// rejection, raises `RLIMIT_NOFILE` by `extra` descriptors and
    /// retries exactly once. The kernel charges registered table slots
    /// against the descriptor limit, so every register path funnels
    /// through here.
    fn register_files_raising_limit<F>(&mut self, extra: u64, register: F) -> Result<u32>
    where
        F: Fn(&mut Self) -> Result<u32>,
    {
        match register(self) {
            Err(Error::Register(e)) if e.raw_os_error() == Some(libc::EMFILE) => {
                metrics::RLIMIT_RAISES.increment();
                warn!(
                    extra,
                    "descriptor limit hit while registering files, raising it once"
                );
                raise_nofile_limit(extra).map_err(Error::Register)?;
                register(self)
            }
            other => other,
        }
    }

    /// Registers a span of descriptors into the fixed-file table.
    ///
    /// On a too-many-open-files rejection, raises `RLIMIT_NOFILE` by the
    /// requested count and retries exactly once.
    pub fn register_files(&mut self, fds: &[RawFd]) -> Result<()> {
        self.register_files_raising_limit(fds.len() as u64, |ring| {
            ring.do_register(
                sys::IORING_REGISTER_FILES,
                fds.as_ptr() as *const libc::c_void,
                fds.len() as u32,
            )
        })?;
        Ok(())
    }

    /// Registers descriptors with a resource tag per file. Carries the
    /// same one-shot limit raise as [`register_files`](Self::register_files).
    pub fn register_files_tagged(&mut self, fds: &[RawFd], tags: &[u64]) -> Result<()> {
        if fds.len() != tags.len() {
            return Err(Error::Config("file and tag counts must match".to_string()));
        }
        let reg = sys::io_uring_rsrc_register {
            nr: fds.len() as u32,
            data: fds.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            ..Default::default()
        };
        self.register_files_raising_limit(fds.len() as u64, |ring| {
            ring.do_register(
                sys::IORING_REGISTER_FILES2,
                &reg as *const sys::io_uring_rsrc_register as *const libc::c_void,
                size_of::<sys::io_uring_rsrc_register>() as u32,
            )
        })?;
        Ok(())
    }

    /// Reserves `count` empty fixed-file table slots for later updates.
    /// Carries the same one-shot limit raise as
    /// [`register_files`](Self::register_files).
    pub fn register_files_sparse(&mut self, count: u32) -> Result<()> {
        let reg = sys::io_uring_rsrc_register {
            nr: count,
            flags: sys::IORING_RSRC_REGISTER_SPARSE,
            ..Default::default()
        };
        self.register_files_raising_limit(count as u64, |ring| {
            ring.do_register(
                sys::IORING_REGISTER_FILES2,
                &reg as *const sys::io_uring_rsrc_register as *const libc::c_void,
                size_of::<sys::io_uring_rsrc_register>() as u32,
            )
        })?;
        Ok(())
    }

    /// Replaces fixed-file table entries starting at `offset`; `-1`
    /// descriptors clear their slot. Returns how many were updated.
    pub fn update_files(&mut self, offset: u32, fds: &[RawFd]) -> Result<u32> {
        let update = sys::io_uring_rsrc_update {
            offset,
            resv: 0,
            data: fds.as_ptr() as u64,
        };
        self.do_register(
            sys::IORING_REGISTER_FILES_UPDATE,
            &update as *const sys::io_uring_rsrc_update as *const libc::c_void,
            fds.len() as u32,
        )
    }

    /// Replaces fixed-file table entries starting at `offset`, tagging each
    /// replacement. Returns how many were updated.
    pub fn update_files_tagged(
        &mut self,
        offset: u32,
        fds: &[RawFd],
        tags: &[u64],
    ) -> Result<u32> {
        if fds.len() != tags.len() {
            return Err(Error::Config("file and tag counts must match".to_string()));
        }
        let update = sys::io_uring_rsrc_update2 {
            offset,
            data: fds.as_ptr() as u64,
            tags: tags.as_ptr() as u64,
            nr: fds.len() as u32,
            ..Default::default()
        };
        self.do_register(
            sys::IORING_REGISTER_FILES_UPDATE2,
            &update as *const sys::io_uring_rsrc_update2 as *const libc::c_void,
            size_of::<sys::io_uring_rsrc_update2>() as u32,
        )
    }

    pub fn unregister_files(&mut self) -> Result<()> {
        self.do_register(sys::IORING_UNREGISTER_FILES, std::ptr::null(), 0)?;
        Ok(())
    }

    // ── Completion eventfd ──────────────────────────────────────────

    /// Signals `event_fd` whenever a completion is posted.
    pub fn register_eventfd(&mut self, event_fd: RawFd) -> Result<()> {
        self.do_register(
            sys::IORING_REGISTER_EVENTFD,
            &event_fd as *const RawFd as *const libc::c_void,
            1,
        )?;
        Ok(())
    }

    /// Like [`register_eventfd`](Self::register_eventfd), but only for
    /// completions of operations that went asynchronous.
    pub fn register_eventfd_async(&mut self, event_fd: RawFd) -> Result<()> {
        self.do_register(
            sys::IORING_REGISTER_EVENTFD_ASYNC,
            &event_fd as *const RawFd as *const libc::c_void,
            1,
        )?;
        Ok(())
    }

    pub fn unregister_eventfd(&mut self) -> Result<()> {
        self.do_register(sys::IORING_UNREGISTER_EVENTFD, std::ptr::null(), 0)?;
        Ok(())
    }

    // ── Capability probe ────────────────────────────────────────────

    /// Asks the kernel which opcodes it supports.
    pub fn probe(&mut self) -> Result<RingProbe> {
        #[repr(C)]
        struct ProbeReply {
            header: sys::io_uring_probe,
            ops: [sys::io_uring_probe_op; sys::PROBE_OPS_LEN],
        }
        let mut reply = ProbeReply {
            header: Default::default(),
            ops: [Default::default(); sys::PROBE_OPS_LEN],
        };
        self.do_register(
            sys::IORING_REGISTER_PROBE,
            &mut reply as *mut ProbeReply as *const libc::c_void,
            sys::PROBE_OPS_LEN as u32,
        )?;
        Ok(RingProbe::from_reply(&reply.header, &reply.ops))
    }

    // ── Personality, restrictions, lifecycle ────────────────────────

    /// Snapshots the calling task's credentials; descriptors can select
    /// them per operation. Returns the personality id.
    pub fn register_personality(&mut self) -> Result<u16> {
        let id = self.do_register(sys::IORING_REGISTER_PERSONALITY, std::ptr::null(), 0)?;
        Ok(id as u16)
    }

    pub fn unregister_personality(&mut self, id: u16) -> Result<()> {
        self.do_register(sys::IORING_UNREGISTER_PERSONALITY, std::ptr::null(), id as u32)?;
        Ok(())
    }

    /// Installs operation restrictions. Only valid while the ring was
    /// created disabled and not yet enabled.
    pub fn register_restrictions(&mut self, rules: &[sys::io_uring_restriction]) -> Result<()> {
        self.do_register(
            sys::IORING_REGISTER_RESTRICTIONS,
            rules.as_ptr() as *const libc::c_void,
            rules.len() as u32,
        )?;
        Ok(())
    }

    /// Starts a ring that was created disabled.
    pub fn enable_rings(&mut self) -> Result<()> {
        self.do_register(sys::IORING_REGISTER_ENABLE_RINGS, std::ptr::null(), 0)?;
        Ok(())
    }

    // ── Async worker pool ───────────────────────────────────────────

    /// Restricts the ring's async workers to a CPU set.
    pub fn register_iowq_affinity(&mut self, cpus: &libc::cpu_set_t) -> Result<()> {
        self.do_register(
            sys::IORING_REGISTER_IOWQ_AFF,
            cpus as *const libc::cpu_set_t as *const libc::c_void,
            size_of::<libc::cpu_set_t>() as u32,
        )?;
        Ok(())
    }

    pub fn unregister_iowq_affinity(&mut self) -> Result<()> {
        self.do_register(sys::IORING_UNREGISTER_IOWQ_AFF, std::ptr::null(), 0)?;
        Ok(())
    }

    /// Caps the bounded and unbounded async worker counts; zeros leave a
    /// cap unchanged. The previous caps are written back into `counts`.
    pub fn register_iowq_max_workers(&mut self, counts: &mut [u32; 2]) -> Result<()> {
        self.do_register(
            sys::IORING_REGISTER_IOWQ_MAX_WORKERS,
            counts.as_mut_ptr() as *const libc::c_void,
            2,
        )?;
        Ok(())
    }

    // ── Ring fd registration ────────────────────────────────────────

    /// Registers the ring's own fd for reduced per-enter overhead.
    /// Subsequent enters pass the registered index instead of the fd.
    pub fn register_ring_fd(&mut self) -> Result<()> {
        if self.registered_index().is_some() {
            return Ok(());
        }
        let mut update = sys::io_uring_rsrc_update {
            offset: u32::MAX,
            resv: 0,
            data: self.fd() as u64,
        };
        self.do_register(
            sys::IORING_REGISTER_RING_FDS,
            &mut update as *mut sys::io_uring_rsrc_update as *const libc::c_void,
            1,
        )?;
        self.set_registered_index(Some(update.offset));
        debug!(index = update.offset, "ring fd registered");
        Ok(())
    }

    /// Drops the ring-fd registration; enters go back through the fd.
    pub fn unregister_ring_fd(&mut self) -> Result<()> {
        let Some(index) = self.registered_index() else {
            return Ok(());
        };
        let update = sys::io_uring_rsrc_update {
            offset: index,
            ..Default::default()
        };
        // Unregistration itself must travel over the real fd.
        metrics::REGISTER_CALLS.increment();
        unsafe {
            sys::io_uring_register(
                self.fd(),
                sys::IORING_UNREGISTER_RING_FDS,
                &update as *const sys::io_uring_rsrc_update as *const libc::c_void,
                1,
            )
        }
        .map_err(Error::Register)?;
        self.set_registered_index(None);
        Ok(())
    }

    // ── Synchronous cancel ──────────────────────────────────────────

    /// Cancels in-flight operations matching `target_user_data` without
    /// consuming a submission slot, waiting up to `timeout` (forever if
    /// `None`) for the targets to complete.
    pub fn cancel_sync(
        &mut self,
        target_user_data: u64,
        flags: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut reg = sys::io_uring_sync_cancel_reg {
            addr: target_user_data,
            fd: -1,
            flags,
            // -1/-1 means no bound.
            timeout: sys::kernel_timespec {
                tv_sec: -1,
                tv_nsec: -1,
            },
            pad: [0; 4],
        };
        if let Some(t) = timeout {
            reg.timeout = sys::kernel_timespec {
                tv_sec: t.as_secs() as i64,
                tv_nsec: t.subsec_nanos() as i64,
            };
        }
        self.do_register(
            sys::IORING_REGISTER_SYNC_CANCEL,
            &reg as *const sys::io_uring_sync_cancel_reg as *const libc::c_void,
            1,
        )?;
        Ok(())
    }

    /// Constrains where file-allocation for direct-placement accepts and
    /// opens may land in the fixed-file table.
    pub fn register_file_alloc_range(&mut self, offset: u32, len: u32) -> Result<()> {
        let range = sys::io_uring_file_index_range {
            off: offset,
            len,
            resv: 0,
        };
        self.do_register(
            sys::IORING_REGISTER_FILE_ALLOC_RANGE,
            &range as *const sys::io_uring_file_index_range as *const libc::c_void,
            0,
        )?;
        Ok(())
    }

    // ── Buffer groups (provide-buffers) ─────────────────────────────

    /// Allocates a pool of `count` buffers of `buf_size` bytes (each
    /// rounded up to a power of two) and hands them to the kernel as
    /// buffer-select group `group`.
    ///
    /// The provide operation travels through the submission queue and is
    /// waited on synchronously, so this is for a quiet ring: call it
    /// before in-flight traffic, or drain completions first.
    pub fn register_buffer_group(
        &mut self,
        group: u16,
        count: u16,
        buf_size: u32,
    ) -> Result<()> {
        if self.groups.contains_key(&group) {
            return Err(Error::Config(format!(
                "buffer group {group} already registered"
            )));
        }
        let pool = BufferGroup::new(group, count, buf_size)?;
        let slot = self.acquire_now()?;
        let base = pool.base_ptr();
        let (len, nbufs) = (pool.buf_size(), pool.buffer_count());
        self.prepare(slot, |sqe| unsafe {
            sqe.prep_provide_buffers(base, len, nbufs, group, 0, REGISTRATION_TAG);
        });
        let outcome = self.wait_for_tag(REGISTRATION_TAG).and_then(|completion| {
            completion
                .io_result()
                .map(|_| ())
                .map_err(Error::BufferGroup)
        });
        if let Err(e) = outcome {
            // A queued or partially honored provide can leave the kernel
            // holding addresses into the block; keep the memory alive
            // instead of freeing it out from under the kernel.
            pool.leak();
            return Err(e);
        }
        debug!(group, buffers = nbufs, buf_size = len, "buffer group registered");
        self.groups.insert(group, pool);
        Ok(())
    }

    /// Takes a buffer group back from the kernel and releases its backing
    /// memory. Unregistering a group that is not present is a no-op.
    pub fn unregister_buffer_group(&mut self, group: u16) -> Result<()> {
        let Some(pool) = self.groups.get(&group) else {
            return Ok(());
        };
        let nbufs = pool.buffer_count();
        let slot = self.acquire_now()?;
        self.prepare(slot, |sqe| {
            sqe.prep_remove_buffers(nbufs, group, REGISTRATION_TAG);
        });
        let completion = self.wait_for_tag(REGISTRATION_TAG)?;
        match completion.io_result() {
            Ok(_) => {}
            // The kernel already handed out every buffer; nothing to take back.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) => return Err(Error::BufferGroup(e)),
        }
        self.groups.remove(&group);
        Ok(())
    }

    // ── Buffer rings ────────────────────────────────────────────────

    /// Builds and registers a ring-mapped buffer ring under `group`.
    /// Re-registering a live group id unregisters the old ring first.
    /// A kernel rejection here is fatal to the call: a half-registered
    /// ring would corrupt buffer-id interpretation.
    pub fn register_buffer_ring(
        &mut self,
        group: u16,
        entries: u16,
        buf_size: u32,
    ) -> Result<()> {
        if self.buf_rings.contains_key(&group) {
            self.unregister_buffer_ring(group)?;
        }
        let ring = BufferRing::new(group, entries, buf_size)?;
        let reg = sys::io_uring_buf_reg {
            ring_addr: ring.ring_addr(),
            ring_entries: ring.entries() as u32,
            bgid: group,
            ..Default::default()
        };
        self.do_register(
            sys::IORING_REGISTER_PBUF_RING,
            &reg as *const sys::io_uring_buf_reg as *const libc::c_void,
            1,
        )?;
        debug!(group, entries = ring.entries(), buf_size, "buffer ring registered");
        self.buf_rings.insert(group, ring);
        Ok(())
    }

    /// Unregisters a buffer ring and releases it. A group id that is not
    /// present is a no-op.
    pub fn unregister_buffer_ring(&mut self, group: u16) -> Result<()> {
        if !self.buf_rings.contains_key(&group) {
            return Ok(());
        }
        let reg = sys::io_uring_buf_reg {
            bgid: group,
            ..Default::default()
        };
        self.do_register(
            sys::IORING_UNREGISTER_PBUF_RING,
            &reg as *const sys::io_uring_buf_reg as *const libc::c_void,
            1,
        )?;
        // Only release the mapping once the kernel has let go of it.
        self.buf_rings.remove(&group);
        Ok(())
    }
}
