//! Submission-side ring state.
//!
//! The submission queue is shared with the kernel through the mapped ring
//! pages: userspace writes descriptors and advances the tail, the kernel
//! consumes descriptors and advances the head. On top of the two shared
//! indices this module keeps a per-slot state machine
//! (`Free → Reserved → Prepared → Submitted → Free`) so that a descriptor
//! is never made kernel-visible while its fields are still being written:
//!
//! * acquiring a slot zeroes it and marks it `Reserved`;
//! * the caller encodes the operation and marks it `Prepared`;
//! * a flush publishes the contiguous `Prepared` prefix by advancing the
//!   shared tail with a release store, marking those slots `Submitted`;
//! * once the kernel confirms consumption the slots return to `Free`.
//!
//! A `Reserved` slot that was never marked `Prepared` blocks the flush of
//! every later slot until it is prepared; kernel-visible order always
//! matches acquisition order.
//!
//! Ordering discipline: the tail store is always release so descriptor
//! writes land first. Loads of the kernel-written head and flags words are
//! acquire only when a kernel polling thread may touch them outside of a
//! syscall; without `SQPOLL` the syscall itself is the barrier and relaxed
//! loads suffice.

use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::metrics;
use crate::sqe::Sqe;
use crate::sys;

/// Token for one acquired submission slot.
///
/// Valid from acquisition until the slot's operation is submitted; the
/// position is recycled after the kernel consumes it, so tokens must not
/// be held across a successful submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(u32);

impl Slot {
    #[inline]
    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Reserved,
    Prepared,
    Submitted,
}

pub(crate) struct SubmissionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    kflags: *const AtomicU32,
    kdropped: *const AtomicU32,
    array: *mut u32,
    sqes: *mut Sqe,
    ring_mask: u32,
    ring_entries: u32,
    // 1 when the ring was set up with 128-byte descriptors.
    sqe_shift: u32,
    sq_poll: bool,
    // Acquire when a kernel polling thread mutates head/flags concurrently,
    // relaxed otherwise.
    head_order: Ordering,
    // Oldest slot not yet confirmed consumed. The shared tail marks the end
    // of the flushed region; `user_tail` the end of the acquired region.
    user_head: u32,
    user_tail: u32,
    states: Box<[SlotState]>,
}

impl SubmissionQueue {
    /// Builds the queue over an established ring mapping.
    ///
    /// # Safety
    /// `ring_base` must point at a live submission ring mapping laid out
    /// per `offsets`, and `sqes_base` at the descriptor array mapping,
    /// both outliving the queue.
    pub(crate) unsafe fn new(
        ring_base: *mut u8,
        sqes_base: *mut u8,
        offsets: &sys::io_sqring_offsets,
        sq_poll: bool,
        sqe128: bool,
    ) -> Self {
        // ring_mask and ring_entries are written once by the kernel at
        // setup and constant afterwards.
        let (ring_mask, ring_entries) = unsafe {
            (
                *(ring_base.add(offsets.ring_mask as usize) as *const u32),
                *(ring_base.add(offsets.ring_entries as usize) as *const u32),
            )
        };
        let (khead, ktail, kflags, kdropped, array) = unsafe {
            (
                ring_base.add(offsets.head as usize) as *const AtomicU32,
                ring_base.add(offsets.tail as usize) as *const AtomicU32,
                ring_base.add(offsets.flags as usize) as *const AtomicU32,
                ring_base.add(offsets.dropped as usize) as *const AtomicU32,
                ring_base.add(offsets.array as usize) as *mut u32,
            )
        };
        Self {
            khead,
            ktail,
            kflags,
            kdropped,
            array,
            sqes: sqes_base as *mut Sqe,
            ring_mask,
            ring_entries,
            sqe_shift: if sqe128 { 1 } else { 0 },
            sq_poll,
            head_order: if sq_poll {
                Ordering::Acquire
            } else {
                Ordering::Relaxed
            },
            user_head: 0,
            user_tail: 0,
            states: vec![SlotState::Free; ring_entries as usize].into_boxed_slice(),
        }
    }

    #[inline]
    fn khead(&self) -> u32 {
        unsafe { (*self.khead).load(self.head_order) }
    }

    #[inline]
    fn ktail(&self) -> u32 {
        // Userspace is the only tail writer.
        unsafe { (*self.ktail).load(Ordering::Relaxed) }
    }

    #[inline]
    fn kflags(&self) -> u32 {
        unsafe { (*self.kflags).load(self.head_order) }
    }

    pub(crate) fn entries(&self) -> u32 {
        self.ring_entries
    }

    /// Slots still available for acquisition.
    pub(crate) fn space_left(&self) -> u32 {
        self.ring_entries - self.user_tail.wrapping_sub(self.khead())
    }

    /// Descriptors the kernel dropped because of a malformed index. Stays
    /// zero in normal operation.
    pub(crate) fn dropped(&self) -> u32 {
        unsafe { (*self.kdropped).load(Ordering::Relaxed) }
    }

    /// Flushed descriptors the kernel has not yet confirmed consumed.
    fn unconfirmed(&self) -> u32 {
        self.ktail().wrapping_sub(self.user_head)
    }

    /// Whether the kernel has flagged overflowed completions or pending
    /// task work that an enter call would flush into the completion ring.
    pub(crate) fn cq_needs_flush(&self) -> bool {
        self.kflags() & (sys::IORING_SQ_CQ_OVERFLOW | sys::IORING_SQ_TASKRUN) != 0
    }

    /// The overflow bit alone, without the task-work bit.
    pub(crate) fn cq_overflowed(&self) -> bool {
        self.kflags() & sys::IORING_SQ_CQ_OVERFLOW != 0
    }

    /// Kernel-visible descriptors not yet consumed.
    fn pending(&self) -> u32 {
        self.ktail().wrapping_sub(self.khead())
    }

    /// Hands out the next free slot, zeroed and `Reserved`, or `None` when
    /// the ring is at capacity.
    pub(crate) fn try_acquire(&mut self) -> Option<Slot> {
        if self.user_tail.wrapping_sub(self.khead()) >= self.ring_entries {
            metrics::SQ_FULL.increment();
            return None;
        }
        let index = self.user_tail & self.ring_mask;
        if self.states[index as usize] != SlotState::Free {
            metrics::SQ_FULL.increment();
            return None;
        }
        unsafe {
            let sqe = self.sqes.add((index << self.sqe_shift) as usize);
            ptr::write_bytes(sqe as *mut u8, 0, size_of::<Sqe>() << self.sqe_shift);
            *self.array.add(index as usize) = index;
        }
        self.states[index as usize] = SlotState::Reserved;
        self.user_tail = self.user_tail.wrapping_add(1);
        Some(Slot(index))
    }

    /// Acquires up to `n` slots, stopping early when the ring fills.
    pub(crate) fn try_acquire_batch(&mut self, n: u32) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(n as usize);
        for _ in 0..n {
            match self.try_acquire() {
                Some(slot) => slots.push(slot),
                None => break,
            }
        }
        slots
    }

    /// The descriptor behind a token, for encoding.
    pub(crate) fn sqe_mut(&mut self, slot: Slot) -> &mut Sqe {
        // Slot indices are produced masked, so the offset is in bounds.
        unsafe { &mut *self.sqes.add((slot.index() << self.sqe_shift) as usize) }
    }

    /// Marks a slot's descriptor fully encoded and eligible for flushing.
    pub(crate) fn mark_prepared(&mut self, slot: Slot) {
        let state = &mut self.states[slot.index() as usize];
        if *state == SlotState::Reserved {
            *state = SlotState::Prepared;
        }
    }

    /// Publishes the contiguous `Prepared` prefix to the kernel and returns
    /// how many descriptors it covered. A `Reserved` gap stops the walk;
    /// slots prepared out of order past the gap wait for a later flush.
    pub(crate) fn flush(&mut self) -> u32 {
        let start = self.ktail();
        let mut tail = start;
        while tail != self.user_tail {
            let index = (tail & self.ring_mask) as usize;
            if self.states[index] != SlotState::Prepared {
                break;
            }
            self.states[index] = SlotState::Submitted;
            tail = tail.wrapping_add(1);
        }
        if tail != start {
            // Release: descriptor and array writes must be visible before
            // the kernel observes the new tail.
            unsafe { (*self.ktail).store(tail, Ordering::Release) };
        }
        tail.wrapping_sub(start)
    }

    /// Whether an enter syscall is required, and with which flags.
    ///
    /// Without `SQPOLL` every handoff needs a syscall. With it, one is
    /// needed only to wake an idle poller thread or to harvest completions
    /// (an explicit wait, or overflow/task-work signalled in the shared
    /// flags word).
    fn enter_plan(&self, min_complete: u32) -> (bool, u32) {
        let mut needed = !self.sq_poll;
        let mut flags = 0;
        if min_complete > 0 || self.cq_needs_flush() {
            flags |= sys::IORING_ENTER_GETEVENTS;
            needed = true;
        }
        if self.sq_poll && self.kflags() & sys::IORING_SQ_NEED_WAKEUP != 0 {
            flags |= sys::IORING_ENTER_SQ_WAKEUP;
            needed = true;
        }
        (needed, flags)
    }

    /// Returns confirmed slots to `Free`, oldest first.
    fn confirm(&mut self, count: u32) {
        for i in 0..count {
            let index = (self.user_head.wrapping_add(i) & self.ring_mask) as usize;
            self.states[index] = SlotState::Free;
        }
        self.user_head = self.user_head.wrapping_add(count);
    }

    /// Flushes prepared descriptors and hands them to the kernel,
    /// optionally waiting for `min_complete` completions. Returns the
    /// number of descriptors the kernel accepted this call, which may be
    /// less than the flushed count if it rejected part of a batch; the
    /// remainder stays published and is offered again on the next submit.
    pub(crate) fn submit(&mut self, fd: RawFd, base_flags: u32, min_complete: u32) -> Result<u32> {
        self.flush();
        let pending = self.pending();
        let (needed, flags) = self.enter_plan(min_complete);
        let consumed = if needed {
            if flags & sys::IORING_ENTER_SQ_WAKEUP != 0 {
                metrics::SQPOLL_WAKEUPS.increment();
            }
            metrics::ENTER_CALLS.increment();
            unsafe { sys::io_uring_enter(fd, pending, min_complete, flags | base_flags) }
                .map_err(Error::Enter)?
        } else {
            // Poller thread consumes on its own; the capacity gate in
            // try_acquire keeps unconsumed slots from being reused.
            pending
        };
        let confirmed = consumed.min(self.unconfirmed());
        self.confirm(confirmed);
        metrics::SQE_SUBMITTED.add(confirmed as u64);
        Ok(consumed)
    }

    /// Like [`submit`](Self::submit), but bounds the completion wait with
    /// `ts` through the extended enter argument. An elapsed timeout is not
    /// an error; the call returns with whatever had been submitted.
    pub(crate) fn submit_wait_timeout(
        &mut self,
        fd: RawFd,
        base_flags: u32,
        min_complete: u32,
        ts: &sys::kernel_timespec,
    ) -> Result<u32> {
        self.flush();
        let pending = self.pending();
        let (_, flags) = self.enter_plan(min_complete);
        if flags & sys::IORING_ENTER_SQ_WAKEUP != 0 {
            metrics::SQPOLL_WAKEUPS.increment();
        }
        let arg = sys::io_uring_getevents_arg {
            ts: ts as *const sys::kernel_timespec as u64,
            ..Default::default()
        };
        metrics::ENTER_CALLS.increment();
        let consumed = match unsafe {
            sys::io_uring_enter_arg(
                fd,
                pending,
                min_complete,
                flags | base_flags | sys::IORING_ENTER_GETEVENTS | sys::IORING_ENTER_EXT_ARG,
                &arg as *const sys::io_uring_getevents_arg as *const libc::c_void,
                size_of::<sys::io_uring_getevents_arg>(),
            )
        } {
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => 0,
            Err(e) => return Err(Error::Enter(e)),
        };
        let confirmed = consumed.min(self.unconfirmed());
        self.confirm(confirmed);
        metrics::SQE_SUBMITTED.add(confirmed as u64);
        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[repr(C)]
    struct FakeSqRing {
        head: AtomicU32,
        tail: AtomicU32,
        flags: AtomicU32,
        dropped: AtomicU32,
        ring_mask: u32,
        ring_entries: u32,
        array: [u32; 8],
    }

    fn fake_offsets() -> sys::io_sqring_offsets {
        sys::io_sqring_offsets {
            head: offset_of!(FakeSqRing, head) as u32,
            tail: offset_of!(FakeSqRing, tail) as u32,
            ring_mask: offset_of!(FakeSqRing, ring_mask) as u32,
            ring_entries: offset_of!(FakeSqRing, ring_entries) as u32,
            flags: offset_of!(FakeSqRing, flags) as u32,
            dropped: offset_of!(FakeSqRing, dropped) as u32,
            array: offset_of!(FakeSqRing, array) as u32,
            ..Default::default()
        }
    }

    fn poisoned_sqe() -> Sqe {
        let mut sqe = Sqe::default();
        sqe.prep_nop(0xDEAD_BEEF);
        sqe
    }

    fn fake_queue(
        entries: u32,
        sq_poll: bool,
        sqe128: bool,
    ) -> (Box<FakeSqRing>, Box<[Sqe]>, SubmissionQueue) {
        assert!(entries.is_power_of_two() && entries <= 8);
        let ring = Box::new(FakeSqRing {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            ring_mask: entries - 1,
            ring_entries: entries,
            array: [u32::MAX; 8],
        });
        let slots = (entries as usize) << (sqe128 as usize);
        let mut sqes = vec![poisoned_sqe(); slots].into_boxed_slice();
        let sq = unsafe {
            SubmissionQueue::new(
                &*ring as *const FakeSqRing as *mut u8,
                sqes.as_mut_ptr() as *mut u8,
                &fake_offsets(),
                sq_poll,
                sqe128,
            )
        };
        (ring, sqes, sq)
    }

    #[test]
    fn acquire_zeroes_slot_and_sets_index() {
        let (ring, _sqes, mut sq) = fake_queue(8, false, false);
        let slot = sq.try_acquire().unwrap();
        assert_eq!(slot.index(), 0);
        let sqe = sq.sqe_mut(slot);
        assert_eq!(sqe.user_data(), 0);
        assert_eq!(sqe.fd(), 0);
        assert_eq!(ring.array[0], 0);
        assert_eq!(sq.space_left(), 7);
    }

    #[test]
    fn acquire_until_full_then_none() {
        let (_ring, _sqes, mut sq) = fake_queue(4, false, false);
        for i in 0..4 {
            assert_eq!(sq.try_acquire().unwrap().index(), i);
        }
        assert!(sq.try_acquire().is_none());
        assert_eq!(sq.space_left(), 0);
    }

    #[test]
    fn batch_acquire_stops_at_capacity() {
        let (_ring, _sqes, mut sq) = fake_queue(4, false, false);
        sq.try_acquire().unwrap();
        let slots = sq.try_acquire_batch(4);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].index(), 1);
        assert!(sq.try_acquire_batch(1).is_empty());
    }

    #[test]
    fn unprepared_slot_is_never_published() {
        let (ring, _sqes, mut sq) = fake_queue(8, false, false);
        sq.try_acquire().unwrap();
        assert_eq!(sq.flush(), 0);
        assert_eq!(ring.tail.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn flush_covers_only_the_prepared_prefix() {
        let (ring, _sqes, mut sq) = fake_queue(8, false, false);
        let slots = sq.try_acquire_batch(4);
        sq.mark_prepared(slots[0]);
        sq.mark_prepared(slots[1]);
        sq.mark_prepared(slots[3]);
        assert_eq!(sq.flush(), 2);
        assert_eq!(ring.tail.load(Ordering::Relaxed), 2);

        // Closing the gap releases the out-of-order slot too.
        sq.mark_prepared(slots[2]);
        assert_eq!(sq.flush(), 2);
        assert_eq!(ring.tail.load(Ordering::Relaxed), 4);
        assert_eq!(sq.flush(), 0);
    }

    #[test]
    fn confirm_recycles_slots_across_wrap() {
        let (ring, _sqes, mut sq) = fake_queue(4, false, false);
        for round in 0..20u32 {
            let slot = sq.try_acquire().unwrap();
            assert_eq!(slot.index(), round & 3);
            sq.mark_prepared(slot);
            assert_eq!(sq.flush(), 1);
            // Kernel consumes and the syscall return confirms it.
            ring.head.store(round + 1, Ordering::Release);
            sq.confirm(1);
        }
        assert_eq!(ring.tail.load(Ordering::Relaxed), 20);
        assert_eq!(sq.space_left(), 4);
    }

    #[test]
    fn enter_needed_without_sqpoll() {
        let (_ring, _sqes, sq) = fake_queue(8, false, false);
        assert_eq!(sq.enter_plan(0), (true, 0));
        assert_eq!(sq.enter_plan(1), (true, sys::IORING_ENTER_GETEVENTS));
    }

    #[test]
    fn enter_skipped_for_quiet_sqpoll() {
        let (ring, _sqes, sq) = fake_queue(8, true, false);
        assert_eq!(sq.enter_plan(0), (false, 0));

        ring.flags
            .store(sys::IORING_SQ_NEED_WAKEUP, Ordering::Release);
        assert_eq!(sq.enter_plan(0), (true, sys::IORING_ENTER_SQ_WAKEUP));

        ring.flags
            .store(sys::IORING_SQ_CQ_OVERFLOW, Ordering::Release);
        assert_eq!(sq.enter_plan(0), (true, sys::IORING_ENTER_GETEVENTS));

        ring.flags.store(0, Ordering::Release);
        assert_eq!(sq.enter_plan(3), (true, sys::IORING_ENTER_GETEVENTS));
    }

    #[test]
    fn big_sqe_mode_doubles_the_stride() {
        let (_ring, sqes, mut sq) = fake_queue(4, false, true);
        let a = sq.try_acquire().unwrap();
        assert_eq!(sq.sqe_mut(a) as *const Sqe, sqes.as_ptr());
        let b = sq.try_acquire().unwrap();
        // Each slot spans two 64-byte records; both halves were zeroed.
        assert_eq!(sq.sqe_mut(b) as *const Sqe, unsafe { sqes.as_ptr().add(2) });
        assert_eq!(sqes[1].user_data(), 0);
        assert_eq!(sqes[3].user_data(), 0);
    }

    #[test]
    fn dropped_counter_reads_shared_word() {
        let (ring, _sqes, sq) = fake_queue(8, false, false);
        assert_eq!(sq.dropped(), 0);
        ring.dropped.store(3, Ordering::Release);
        assert_eq!(sq.dropped(), 3);
    }
}
