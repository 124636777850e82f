//! Ring lifecycle and the public submit/complete API.
//!
//! A [`Ring`] negotiates its geometry with the kernel, maps the shared
//! ring pages, and owns both queues plus the tables of registered buffer
//! pools. It is a single-issuer object: one thread drives submission and
//! completion at a time. It may move between threads, never be shared.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::{BufferGroup, BufferRing};
use crate::config::Config;
use crate::cqueue::{Completion, CompletionQueue};
use crate::error::{Error, Result};
use crate::metrics;
use crate::mmap::MappedRegion;
use crate::sqe::Sqe;
use crate::squeue::{Slot, SubmissionQueue};
use crate::sys;

/// An operation builder parked until a submission slot frees up.
type DeferredOp = Box<dyn FnOnce(&mut Ring, Slot)>;

/// Correlation tag reserved for the ring's own registration traffic.
pub(crate) const REGISTRATION_TAG: u64 = u64::MAX;

pub struct Ring {
    fd: RawFd,
    setup_flags: u32,
    features: u32,
    // Offset in the kernel's registered-ring table, for the reduced
    // overhead enter path.
    registered_index: Option<u32>,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    // Mapped regions in acquisition order; taken in reverse at teardown.
    sq_map: Option<MappedRegion>,
    sqe_map: Option<MappedRegion>,
    cq_map: Option<MappedRegion>,
    pub(crate) groups: HashMap<u16, BufferGroup>,
    pub(crate) buf_rings: HashMap<u16, BufferRing>,
    deferred: VecDeque<DeferredOp>,
}

impl Ring {
    /// Creates a ring with at least `entries` submission slots and default
    /// options.
    pub fn new(entries: u32) -> Result<Self> {
        Self::with_config(&Config {
            entries,
            ..Default::default()
        })
    }

    /// Creates a ring from a full configuration.
    ///
    /// Entry counts are rounded up to powers of two; the negotiated counts
    /// are readable afterwards from [`entries`](Self::entries) and
    /// [`cq_entries`](Self::cq_entries). Construction either returns a
    /// fully established ring or tears down every partial resource.
    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let entries = config
            .entries
            .next_power_of_two()
            .min(sys::IORING_MAX_ENTRIES);
        let mut params = config.to_params();
        let fd = sys::io_uring_setup(entries, &mut params).map_err(Error::Setup)?;
        match Self::establish(fd, config, &params) {
            Ok(ring) => Ok(ring),
            Err(e) => {
                // Mapped regions are already released by drop; the fd is ours.
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    fn establish(fd: RawFd, config: &Config, params: &sys::io_uring_params) -> Result<Self> {
        let sqe_stride = size_of::<Sqe>() << (config.sqe128 as usize);
        let cqe_stride = size_of::<sys::io_uring_cqe>() << (config.cqe32 as usize);

        let mut sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
        let cq_ring_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * cqe_stride;
        let single_mmap = params.features & sys::IORING_FEAT_SINGLE_MMAP != 0;
        if single_mmap {
            sq_ring_len = sq_ring_len.max(cq_ring_len);
        }

        let sq_map = MappedRegion::map(fd, sq_ring_len, sys::IORING_OFF_SQ_RING)
            .map_err(Error::MapSubmissionRing)?;
        let sqe_map = MappedRegion::map(
            fd,
            params.sq_entries as usize * sqe_stride,
            sys::IORING_OFF_SQES,
        )
        .map_err(Error::MapSubmissionEntries)?;
        let cq_map = if single_mmap {
            None
        } else {
            Some(
                MappedRegion::map(fd, cq_ring_len, sys::IORING_OFF_CQ_RING)
                    .map_err(Error::MapCompletionRing)?,
            )
        };

        if config.dont_fork {
            sq_map.dont_fork().map_err(Error::Advise)?;
            sqe_map.dont_fork().map_err(Error::Advise)?;
            if let Some(region) = &cq_map {
                region.dont_fork().map_err(Error::Advise)?;
            }
        }

        let sq = unsafe {
            SubmissionQueue::new(
                sq_map.as_ptr(),
                sqe_map.as_ptr(),
                &params.sq_off,
                config.sq_poll.is_some(),
                config.sqe128,
            )
        };
        let cq_base = cq_map.as_ref().map_or(sq_map.as_ptr(), |m| m.as_ptr());
        let cq = unsafe { CompletionQueue::new(cq_base, &params.cq_off, config.cqe32) };

        debug!(
            entries = params.sq_entries,
            cq_entries = params.cq_entries,
            features = params.features,
            sq_bytes = sq_map.len(),
            sqe_bytes = sqe_map.len(),
            "ring established"
        );

        Ok(Self {
            fd,
            setup_flags: params.flags,
            features: params.features,
            registered_index: None,
            sq,
            cq,
            sq_map: Some(sq_map),
            sqe_map: Some(sqe_map),
            cq_map,
            groups: HashMap::new(),
            buf_rings: HashMap::new(),
            deferred: VecDeque::new(),
        })
    }

    // ── Introspection ───────────────────────────────────────────────

    /// The ring file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Negotiated submission queue depth.
    pub fn entries(&self) -> u32 {
        self.sq.entries()
    }

    /// Negotiated completion queue depth.
    pub fn cq_entries(&self) -> u32 {
        self.cq.entries()
    }

    /// Setup flags the ring was created with.
    pub fn setup_flags(&self) -> u32 {
        self.setup_flags
    }

    /// Feature bits the kernel reported at setup.
    pub fn features(&self) -> u32 {
        self.features
    }

    /// Whether the kernel reported a `IORING_FEAT_*` bit.
    pub fn has_feature(&self, feature: u32) -> bool {
        self.features & feature != 0
    }

    /// One mapping covers both rings (kernel 5.4+).
    pub fn feat_single_mmap(&self) -> bool {
        self.has_feature(sys::IORING_FEAT_SINGLE_MMAP)
    }

    /// Completions are never dropped; the kernel stashes overflow instead.
    pub fn feat_nodrop(&self) -> bool {
        self.has_feature(sys::IORING_FEAT_NODROP)
    }

    /// The extended-argument enter form (wait timeouts) is available.
    pub fn feat_ext_arg(&self) -> bool {
        self.has_feature(sys::IORING_FEAT_EXT_ARG)
    }

    /// Submission slots currently free.
    pub fn sq_space_left(&self) -> u32 {
        self.sq.space_left()
    }

    /// Submissions the kernel dropped for malformed indices.
    pub fn sq_dropped(&self) -> u32 {
        self.sq.dropped()
    }

    /// Completions waiting in the ring.
    pub fn cq_ready(&self) -> u32 {
        self.cq.ready()
    }

    /// Completions the kernel could not post for lack of ring space.
    pub fn cq_overflow(&self) -> u32 {
        self.cq.overflow()
    }

    // ── Slots and submission ────────────────────────────────────────

    /// Hands out one free submission slot, or `None` when the ring is at
    /// capacity.
    pub fn try_slot(&mut self) -> Option<Slot> {
        self.sq.try_acquire()
    }

    /// Hands out up to `n` slots, fewer when the ring fills first.
    pub fn try_slots(&mut self, n: u32) -> Vec<Slot> {
        self.sq.try_acquire_batch(n)
    }

    /// The descriptor behind a slot, for encoding.
    pub fn sqe_mut(&mut self, slot: Slot) -> &mut Sqe {
        self.sq.sqe_mut(slot)
    }

    /// Marks a slot fully encoded; only prepared slots are ever handed to
    /// the kernel.
    pub fn mark_prepared(&mut self, slot: Slot) {
        self.sq.mark_prepared(slot);
    }

    /// Encodes a slot through `f` and marks it prepared in one step.
    pub fn prepare<F: FnOnce(&mut Sqe)>(&mut self, slot: Slot, f: F) {
        f(self.sq.sqe_mut(slot));
        self.sq.mark_prepared(slot);
    }

    /// Runs an operation builder now if a slot is free, otherwise parks it
    /// for the drain pass of a later submit. Parked work is never dropped.
    pub fn issue<F>(&mut self, op: F)
    where
        F: FnOnce(&mut Ring, Slot) + 'static,
    {
        match self.try_slot() {
            Some(slot) => op(self, slot),
            None => {
                metrics::OPS_DEFERRED.increment();
                self.deferred.push_back(Box::new(op));
            }
        }
    }

    fn drain_deferred(&mut self) {
        while let Some(op) = self.deferred.pop_front() {
            match self.try_slot() {
                Some(slot) => op(self, slot),
                None => {
                    self.deferred.push_front(op);
                    break;
                }
            }
        }
    }

    /// Publishes prepared slots and hands them to the kernel. Returns the
    /// number of descriptors the kernel accepted.
    pub fn submit(&mut self) -> Result<u32> {
        let (fd, flags) = self.enter_target();
        let submitted = self.sq.submit(fd, flags, 0)?;
        self.drain_deferred();
        Ok(submitted)
    }

    /// Like [`submit`](Self::submit), also blocking until `min_complete`
    /// completions are available.
    pub fn submit_and_wait(&mut self, min_complete: u32) -> Result<u32> {
        let (fd, flags) = self.enter_target();
        let submitted = self.sq.submit(fd, flags, min_complete)?;
        self.drain_deferred();
        Ok(submitted)
    }

    /// Like [`submit_and_wait`](Self::submit_and_wait) with an upper bound
    /// on the wait. An elapsed timeout is not an error: the call returns
    /// normally with whatever completions arrived left in the ring.
    pub fn submit_and_wait_timeout(
        &mut self,
        min_complete: u32,
        timeout: Duration,
    ) -> Result<u32> {
        if !self.feat_ext_arg() {
            return Err(Error::Unsupported("extended enter arguments"));
        }
        let ts = sys::kernel_timespec {
            tv_sec: timeout.as_secs() as i64,
            tv_nsec: timeout.subsec_nanos() as i64,
        };
        let (fd, flags) = self.enter_target();
        let submitted = self.sq.submit_wait_timeout(fd, flags, min_complete, &ts)?;
        self.drain_deferred();
        Ok(submitted)
    }

    /// Forces a zero-submission kernel transition purely to harvest
    /// completions, e.g. after an overflow. Retries on signal interrupt.
    pub fn get_events(&mut self) -> Result<()> {
        let (fd, base) = self.enter_target();
        loop {
            metrics::ENTER_CALLS.increment();
            match unsafe {
                sys::io_uring_enter(fd, 0, 0, base | sys::IORING_ENTER_GETEVENTS)
            } {
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(Error::Enter(e)),
            }
        }
    }

    /// Fd and flag word for enter calls, honoring ring-fd registration.
    fn enter_target(&self) -> (RawFd, u32) {
        match self.registered_index {
            Some(index) => (index as RawFd, sys::IORING_ENTER_REGISTERED_RING),
            None => (self.fd, 0),
        }
    }

    pub(crate) fn set_registered_index(&mut self, index: Option<u32>) {
        self.registered_index = index;
    }

    pub(crate) fn registered_index(&self) -> Option<u32> {
        self.registered_index
    }

    // ── Completions ─────────────────────────────────────────────────

    /// Dequeues the oldest completion, or `None` when the ring is empty.
    pub fn try_completion(&mut self) -> Option<Completion> {
        self.cq.try_dequeue()
    }

    /// Copies up to `out.len()` completions out of the ring.
    ///
    /// When the ring looks empty but the kernel has flagged overflowed
    /// completions or pending task work, one zero-submission enter flushes
    /// them into the ring and the read retries exactly once. A ring that
    /// is empty with nothing flagged costs no syscall.
    pub fn try_completions(&mut self, out: &mut [Completion]) -> Result<usize> {
        let n = self.cq.harvest(out);
        if n > 0 || !self.sq.cq_needs_flush() {
            return Ok(n);
        }
        if self.sq.cq_overflowed() {
            warn!(
                overflow = self.cq.overflow(),
                "recovering overflowed completions"
            );
        }
        metrics::CQ_OVERFLOW_RECOVERIES.increment();
        self.get_events()?;
        Ok(self.cq.harvest(out))
    }

    /// Discards up to `count` completions without decoding them.
    pub fn ignore_completions(&mut self, count: u32) -> u32 {
        self.cq.ignore(count)
    }

    // ── Registration support ────────────────────────────────────────

    /// A slot for the ring's own registration traffic: submits once to
    /// free confirmed slots if the queue is full.
    pub(crate) fn acquire_now(&mut self) -> Result<Slot> {
        if let Some(slot) = self.try_slot() {
            return Ok(slot);
        }
        self.submit()?;
        self.try_slot().ok_or_else(|| {
            Error::BufferGroup(std::io::Error::from(std::io::ErrorKind::WouldBlock))
        })
    }

    /// Submits and blocks until the completion carrying `tag` arrives.
    ///
    /// Used for registration operations issued while the ring is quiet;
    /// unrelated completions encountered on the way are discarded.
    pub(crate) fn wait_for_tag(&mut self, tag: u64) -> Result<Completion> {
        loop {
            self.submit_and_wait(1)?;
            while let Some(completion) = self.try_completion() {
                if completion.user_data() == tag {
                    return Ok(completion);
                }
                debug!(
                    user_data = completion.user_data(),
                    "discarding unrelated completion during a registration wait"
                );
            }
        }
    }

    /// The backing pool registered under a group id, if any.
    pub fn buffer_group(&self, group: u16) -> Option<&BufferGroup> {
        self.groups.get(&group)
    }

    /// The buffer ring registered under a group id, if any.
    pub fn buffer_ring(&self, group: u16) -> Option<&BufferRing> {
        self.buf_rings.get(&group)
    }

    /// Mutable access to a registered buffer ring, for replenishing.
    pub fn buffer_ring_mut(&mut self, group: u16) -> Option<&mut BufferRing> {
        self.buf_rings.get_mut(&group)
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // Reverse acquisition order: descriptor array first, then the two
        // ring mappings, then the fd (after dropping its registration),
        // then the buffer tables.
        self.sqe_map.take();
        self.sq_map.take();
        self.cq_map.take();
        if self.registered_index.is_some() {
            if let Err(e) = self.unregister_ring_fd() {
                warn!("leaving ring fd registered at teardown: {e}");
            }
        }
        unsafe { libc::close(self.fd) };
        self.groups.clear();
        self.buf_rings.clear();
    }
}

// Safety: every raw pointer in the queues targets mappings owned by this
// value, and the single-issuer contract keeps use on one thread at a time.
unsafe impl Send for Ring {}

/// Bytes of memlock budget a ring with this configuration needs.
///
/// Kernels since 5.12 account ring memory against the process instead of
/// `RLIMIT_MEMLOCK`; for older kernels this is the amount to budget before
/// creating the ring.
pub fn mlock_size(config: &Config) -> Result<usize> {
    config.validate()?;
    let entries = config
        .entries
        .next_power_of_two()
        .min(sys::IORING_MAX_ENTRIES);
    let cq_entries = config
        .cq_entries
        .unwrap_or(2 * entries)
        .next_power_of_two()
        .min(sys::IORING_MAX_CQ_ENTRIES);
    let page = sys::page_size();

    let cqe_stride = size_of::<sys::io_uring_cqe>() << (config.cqe32 as usize);
    let sqe_stride = size_of::<Sqe>() << (config.sqe128 as usize);

    // Ring header plus records, cacheline padded; each region's page
    // count then rounds to the next power of two, the granularity
    // pre-5.12 kernels charge at.
    let cq_size = (sys::RING_HEADER_SIZE + cq_entries as usize * cqe_stride + 63) & !63;
    let cq_pages = cq_size.div_ceil(page).next_power_of_two();
    let sqe_pages = (entries as usize * sqe_stride)
        .div_ceil(page)
        .next_power_of_two();
    Ok((cq_pages + sqe_pages) * page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entries: u32) -> Config {
        Config {
            entries,
            ..Default::default()
        }
    }

    #[test]
    fn mlock_size_is_page_granular() {
        let page = sys::page_size();
        let small = mlock_size(&config(8)).unwrap();
        assert!(small >= 2 * page);
        assert_eq!(small % page, 0);
    }

    #[test]
    fn mlock_size_grows_with_depth_and_record_width() {
        let small = mlock_size(&config(8)).unwrap();
        let large = mlock_size(&config(4096)).unwrap();
        assert!(large > small);

        let wide = mlock_size(&Config {
            entries: 4096,
            sqe128: true,
            cqe32: true,
            ..Default::default()
        })
        .unwrap();
        assert!(wide > large);
    }

    #[test]
    fn mlock_size_charges_power_of_two_pages_per_region() {
        // A 4096-entry default ring needs 33 completion-region pages and
        // 64 descriptor-array pages at 4 KiB; both regions charge at the
        // next power of two, so the budget is 64 + 64 pages.
        assert_eq!(mlock_size(&config(4096)).unwrap(), 524288);
    }

    #[test]
    fn mlock_size_rejects_invalid_config() {
        assert!(mlock_size(&config(0)).is_err());
    }
}
