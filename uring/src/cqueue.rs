//! Completion-side ring state.
//!
//! Roles are reversed from the submission side: the kernel writes
//! completion records and advances the tail, userspace consumes records
//! and advances the head. The kernel posts completions from task-work and
//! interrupt context, not just inside our syscalls, so the tail load is
//! always acquire; the head store is always release so the kernel never
//! recycles a record slot we are still reading.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::metrics;
use crate::sys;

/// One dequeued completion record.
///
/// `result` follows the syscall convention: non-negative is the
/// operation's return value, negative is a negated errno. Errors ride in
/// the record as data; dequeueing never fails because an operation did.
#[derive(Debug, Default, Clone, Copy)]
pub struct Completion {
    user_data: u64,
    res: i32,
    flags: u32,
}

impl Completion {
    /// The correlation tag from the matching submission.
    #[inline]
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Raw result field.
    #[inline]
    pub fn result(&self) -> i32 {
        self.res
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// The result with the negative-errno convention decoded.
    pub fn io_result(&self) -> io::Result<u32> {
        if self.res >= 0 {
            Ok(self.res as u32)
        } else {
            Err(io::Error::from_raw_os_error(-self.res))
        }
    }

    /// The buffer the kernel picked from a registered group, if this
    /// completion used buffer selection.
    pub fn buffer_id(&self) -> Option<u16> {
        if self.flags & sys::IORING_CQE_F_BUFFER != 0 {
            Some((self.flags >> sys::IORING_CQE_BUFFER_SHIFT) as u16)
        } else {
            None
        }
    }

    /// More completions from the same multi-shot submission will follow.
    #[inline]
    pub fn more(&self) -> bool {
        self.flags & sys::IORING_CQE_F_MORE != 0
    }

    /// The socket still held unread data when this receive completed.
    #[inline]
    pub fn sock_nonempty(&self) -> bool {
        self.flags & sys::IORING_CQE_F_SOCK_NONEMPTY != 0
    }

    /// Zero-copy notification record rather than an operation result.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.flags & sys::IORING_CQE_F_NOTIF != 0
    }
}

pub(crate) struct CompletionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    koverflow: *const AtomicU32,
    cqes: *const sys::io_uring_cqe,
    ring_mask: u32,
    ring_entries: u32,
    // 1 when the ring was set up with 32-byte completion records.
    cqe_shift: u32,
}

impl CompletionQueue {
    /// Builds the queue over an established ring mapping.
    ///
    /// # Safety
    /// `ring_base` must point at a live completion ring mapping laid out
    /// per `offsets`, outliving the queue.
    pub(crate) unsafe fn new(
        ring_base: *mut u8,
        offsets: &sys::io_cqring_offsets,
        cqe32: bool,
    ) -> Self {
        let (ring_mask, ring_entries) = unsafe {
            (
                *(ring_base.add(offsets.ring_mask as usize) as *const u32),
                *(ring_base.add(offsets.ring_entries as usize) as *const u32),
            )
        };
        let (khead, ktail, koverflow, cqes) = unsafe {
            (
                ring_base.add(offsets.head as usize) as *const AtomicU32,
                ring_base.add(offsets.tail as usize) as *const AtomicU32,
                ring_base.add(offsets.overflow as usize) as *const AtomicU32,
                ring_base.add(offsets.cqes as usize) as *const sys::io_uring_cqe,
            )
        };
        Self {
            khead,
            ktail,
            koverflow,
            cqes,
            ring_mask,
            ring_entries,
            cqe_shift: if cqe32 { 1 } else { 0 },
        }
    }

    #[inline]
    fn head(&self) -> u32 {
        // Userspace is the only head writer.
        unsafe { (*self.khead).load(Ordering::Relaxed) }
    }

    #[inline]
    fn tail(&self) -> u32 {
        unsafe { (*self.ktail).load(Ordering::Acquire) }
    }

    fn publish_head(&mut self, head: u32) {
        unsafe { (*self.khead).store(head, Ordering::Release) };
    }

    fn decode(&self, at: u32) -> Completion {
        // Valid only for positions in [head, tail).
        let cqe = unsafe {
            &*self
                .cqes
                .add(((at & self.ring_mask) << self.cqe_shift) as usize)
        };
        Completion {
            user_data: cqe.user_data,
            res: cqe.res,
            flags: cqe.flags,
        }
    }

    pub(crate) fn entries(&self) -> u32 {
        self.ring_entries
    }

    /// Completions posted but not yet dequeued.
    pub(crate) fn ready(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    /// Completions the kernel dropped because the ring was full. Modern
    /// kernels stash them instead and signal overflow in the submission
    /// ring's flags word.
    pub(crate) fn overflow(&self) -> u32 {
        unsafe { (*self.koverflow).load(Ordering::Relaxed) }
    }

    /// Dequeues the oldest completion, or `None` when the ring is empty.
    pub(crate) fn try_dequeue(&mut self) -> Option<Completion> {
        let head = self.head();
        if head == self.tail() {
            return None;
        }
        let completion = self.decode(head);
        self.publish_head(head.wrapping_add(1));
        metrics::CQE_HARVESTED.increment();
        Some(completion)
    }

    /// Copies out up to `out.len()` completions with a single head
    /// publish, returning how many were copied.
    pub(crate) fn harvest(&mut self, out: &mut [Completion]) -> usize {
        let head = self.head();
        let n = self.ready().min(out.len() as u32);
        for i in 0..n {
            out[i as usize] = self.decode(head.wrapping_add(i));
        }
        if n > 0 {
            self.publish_head(head.wrapping_add(n));
            metrics::CQE_HARVESTED.add(n as u64);
        }
        n as usize
    }

    /// Discards up to `count` completions without decoding them,
    /// returning how many were discarded. A no-op on an empty ring.
    pub(crate) fn ignore(&mut self, count: u32) -> u32 {
        let n = self.ready().min(count);
        if n > 0 {
            self.publish_head(self.head().wrapping_add(n));
            metrics::CQE_HARVESTED.add(n as u64);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[repr(C)]
    struct FakeCqRing {
        head: AtomicU32,
        tail: AtomicU32,
        overflow: AtomicU32,
        ring_mask: u32,
        ring_entries: u32,
        cqes: [sys::io_uring_cqe; 16],
    }

    fn fake_offsets() -> sys::io_cqring_offsets {
        sys::io_cqring_offsets {
            head: offset_of!(FakeCqRing, head) as u32,
            tail: offset_of!(FakeCqRing, tail) as u32,
            overflow: offset_of!(FakeCqRing, overflow) as u32,
            ring_mask: offset_of!(FakeCqRing, ring_mask) as u32,
            ring_entries: offset_of!(FakeCqRing, ring_entries) as u32,
            cqes: offset_of!(FakeCqRing, cqes) as u32,
            ..Default::default()
        }
    }

    fn fake_queue(entries: u32, cqe32: bool) -> (Box<FakeCqRing>, CompletionQueue) {
        assert!(entries.is_power_of_two() && (entries << (cqe32 as u32)) <= 16);
        let ring = Box::new(FakeCqRing {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            overflow: AtomicU32::new(0),
            ring_mask: entries - 1,
            ring_entries: entries,
            cqes: [sys::io_uring_cqe::default(); 16],
        });
        let cq = unsafe {
            CompletionQueue::new(
                &*ring as *const FakeCqRing as *mut u8,
                &fake_offsets(),
                cqe32,
            )
        };
        (ring, cq)
    }

    /// Appends a record the way the kernel does: record first, tail after.
    fn post(ring: &FakeCqRing, cq: &CompletionQueue, user_data: u64, res: i32, flags: u32) {
        let tail = ring.tail.load(Ordering::Relaxed);
        let at = ((tail & ring.ring_mask) << cq.cqe_shift) as usize;
        let cqe = &ring.cqes[at] as *const sys::io_uring_cqe as *mut sys::io_uring_cqe;
        unsafe {
            (*cqe).user_data = user_data;
            (*cqe).res = res;
            (*cqe).flags = flags;
        }
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    #[test]
    fn empty_ring_returns_none() {
        let (_ring, mut cq) = fake_queue(8, false);
        assert_eq!(cq.ready(), 0);
        assert!(cq.try_dequeue().is_none());
    }

    #[test]
    fn dequeue_preserves_fifo_order() {
        let (ring, mut cq) = fake_queue(8, false);
        for tag in 0..3 {
            post(&ring, &cq, tag, tag as i32 * 10, 0);
        }
        for tag in 0..3 {
            let c = cq.try_dequeue().unwrap();
            assert_eq!(c.user_data(), tag);
            assert_eq!(c.result(), tag as i32 * 10);
        }
        assert!(cq.try_dequeue().is_none());
        assert_eq!(ring.head.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn harvest_respects_buffer_capacity() {
        let (ring, mut cq) = fake_queue(8, false);
        for tag in 0..5 {
            post(&ring, &cq, tag, 0, 0);
        }
        let mut out = [Completion::default(); 3];
        assert_eq!(cq.harvest(&mut out), 3);
        assert_eq!(out[0].user_data(), 0);
        assert_eq!(out[2].user_data(), 2);
        assert_eq!(cq.harvest(&mut out), 2);
        assert_eq!(out[0].user_data(), 3);
        assert_eq!(cq.harvest(&mut out), 0);
    }

    #[test]
    fn ignore_discards_without_decoding() {
        let (ring, mut cq) = fake_queue(8, false);
        for tag in 0..4 {
            post(&ring, &cq, tag, 0, 0);
        }
        assert_eq!(cq.ignore(2), 2);
        assert_eq!(cq.try_dequeue().unwrap().user_data(), 2);
        assert_eq!(cq.ignore(10), 1);
        assert_eq!(cq.ignore(1), 0);
    }

    #[test]
    fn head_and_tail_wrap() {
        let (ring, mut cq) = fake_queue(4, false);
        for round in 0..12 {
            post(&ring, &cq, round, 1, 0);
            let c = cq.try_dequeue().unwrap();
            assert_eq!(c.user_data(), round);
        }
        assert_eq!(ring.head.load(Ordering::Relaxed), 12);
    }

    #[test]
    fn big_cqe_mode_doubles_the_stride() {
        let (ring, mut cq) = fake_queue(8, true);
        post(&ring, &cq, 7, 0, 0);
        post(&ring, &cq, 8, 0, 0);
        // The second record landed two 16-byte slots in.
        assert_eq!(ring.cqes[2].user_data, 8);
        assert_eq!(cq.try_dequeue().unwrap().user_data(), 7);
        assert_eq!(cq.try_dequeue().unwrap().user_data(), 8);
    }

    #[test]
    fn result_decodes_negative_errno() {
        let ok = Completion {
            user_data: 1,
            res: 42,
            flags: 0,
        };
        assert_eq!(ok.io_result().unwrap(), 42);

        let err = Completion {
            user_data: 2,
            res: -libc::ENOENT,
            flags: 0,
        };
        assert_eq!(
            err.io_result().unwrap_err().raw_os_error(),
            Some(libc::ENOENT)
        );
    }

    #[test]
    fn buffer_id_rides_in_the_flag_word() {
        let c = Completion {
            user_data: 0,
            res: 100,
            flags: sys::IORING_CQE_F_BUFFER | (9 << sys::IORING_CQE_BUFFER_SHIFT),
        };
        assert_eq!(c.buffer_id(), Some(9));
        assert!(!c.more());

        let plain = Completion {
            user_data: 0,
            res: 100,
            flags: sys::IORING_CQE_F_MORE,
        };
        assert_eq!(plain.buffer_id(), None);
        assert!(plain.more());
    }
}
