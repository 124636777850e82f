//! Provided-buffer pools.
//!
//! Two kernel mechanisms hand pre-supplied buffers to buffer-select
//! operations, both keyed by a small group id echoed back in completion
//! flags:
//!
//! * [`BufferGroup`]: the classic pool fed to the kernel with a
//!   provide-buffers operation through the submission queue;
//! * [`BufferRing`]: the ring-mapped variant where userspace replenishes
//!   buffers by appending entries and publishing a tail, no submission
//!   needed.
//!
//! Backing memory must outlive every in-flight operation that may still
//! write into it; the owning ring keeps each pool alive until it is
//! unregistered or the ring itself is torn down.

use std::alloc::{self, Layout};
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{Error, Result};
use crate::sys;

/// Backing storage for one registered buffer group.
///
/// Buffer size and count are both rounded up to powers of two at
/// construction; buffer ids run `0..buffer_count()` and index the backing
/// block at fixed strides.
pub struct BufferGroup {
    base: *mut u8,
    layout: Layout,
    group: u16,
    buf_size: u32,
    count: u16,
}

impl BufferGroup {
    pub(crate) fn new(group: u16, count: u16, buf_size: u32) -> Result<Self> {
        if count == 0 || buf_size == 0 {
            return Err(Error::Config(
                "buffer group needs a nonzero buffer count and size".to_string(),
            ));
        }
        let count = count
            .checked_next_power_of_two()
            .ok_or_else(|| Error::Config("buffer count rounds past u16::MAX".to_string()))?;
        let buf_size = buf_size
            .checked_next_power_of_two()
            .ok_or_else(|| Error::Config("buffer size rounds past u32::MAX".to_string()))?;
        let total = count as usize * buf_size as usize;
        let layout = Layout::from_size_align(total, sys::page_size())
            .map_err(|_| Error::Config("buffer group backing block too large".to_string()))?;
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Ok(Self {
            base,
            layout,
            group,
            buf_size,
            count,
        })
    }

    #[inline]
    pub fn group(&self) -> u16 {
        self.group
    }

    /// Per-buffer size after rounding.
    #[inline]
    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    /// Number of buffers after rounding.
    #[inline]
    pub fn buffer_count(&self) -> u16 {
        self.count
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer and capacity of the buffer an id refers to.
    ///
    /// The kernel reports the id it picked in the completion's flag word;
    /// the valid byte count is the completion's result.
    pub fn buffer(&self, bid: u16) -> (*const u8, u32) {
        assert!(bid < self.count, "buffer id {bid} out of range");
        let ptr = unsafe { self.base.add(bid as usize * self.buf_size as usize) };
        (ptr, self.buf_size)
    }

    /// Gives up the backing block without freeing it, returning its base.
    ///
    /// For paths where an operation referencing the block may still be
    /// queued kernel-side; the memory then has to outlive the ring.
    pub(crate) fn leak(self) -> *mut u8 {
        let base = self.base;
        std::mem::forget(self);
        base
    }
}

impl Drop for BufferGroup {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base, self.layout) };
    }
}

// Safety: the backing block is owned by this value and the kernel only
// touches it through operations whose lifetime the owning ring controls.
unsafe impl Send for BufferGroup {}

/// A ring-mapped provided-buffer ring.
///
/// The descriptor ring is an anonymous shared mapping the kernel reads
/// directly once registered. All buffers are pushed at construction;
/// callers hand consumed ids back with [`replenish`](Self::replenish).
pub struct BufferRing {
    ring_ptr: *mut u8,
    ring_mmap_len: usize,
    backing: Vec<u8>,
    group: u16,
    entries: u16,
    buf_size: u32,
    tail: u16,
    mask: u16,
}

impl BufferRing {
    const ENTRY_SIZE: usize = size_of::<sys::io_uring_buf>();
    // The shared tail overlays entry 0's reserved field.
    const TAIL_OFFSET: usize = offset_of!(sys::io_uring_buf, resv);

    pub(crate) fn new(group: u16, entries: u16, buf_size: u32) -> Result<Self> {
        if entries == 0 || buf_size == 0 {
            return Err(Error::Config(
                "buffer ring needs a nonzero entry count and buffer size".to_string(),
            ));
        }
        // The kernel requires a power-of-two entry count.
        let entries = entries
            .checked_next_power_of_two()
            .ok_or_else(|| Error::Config("buffer ring entries round past u16::MAX".to_string()))?;
        let ring_mmap_len = entries as usize * Self::ENTRY_SIZE;
        let backing = vec![0u8; entries as usize * buf_size as usize];

        let ring_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ring_mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if ring_ptr == libc::MAP_FAILED {
            return Err(Error::BufferGroup(std::io::Error::last_os_error()));
        }

        let mut ring = Self {
            ring_ptr: ring_ptr as *mut u8,
            ring_mmap_len,
            backing,
            group,
            entries,
            buf_size,
            tail: 0,
            mask: entries - 1,
        };
        for bid in 0..entries {
            ring.push(bid);
        }
        ring.commit_tail();
        Ok(ring)
    }

    /// Ring address for kernel registration.
    pub(crate) fn ring_addr(&self) -> u64 {
        self.ring_ptr as u64
    }

    #[inline]
    pub fn group(&self) -> u16 {
        self.group
    }

    #[inline]
    pub fn entries(&self) -> u16 {
        self.entries
    }

    #[inline]
    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    /// Pointer and capacity of the buffer an id refers to.
    pub fn buffer(&self, bid: u16) -> (*const u8, u32) {
        assert!(bid < self.entries, "buffer id {bid} out of range");
        let ptr = unsafe { self.backing.as_ptr().add(bid as usize * self.buf_size as usize) };
        (ptr, self.buf_size)
    }

    /// Returns a consumed buffer to the kernel.
    pub fn replenish(&mut self, bid: u16) {
        self.push(bid);
        self.commit_tail();
    }

    /// Returns a batch of consumed buffers with a single tail publish.
    pub fn replenish_batch(&mut self, bids: &[u16]) {
        for &bid in bids {
            self.push(bid);
        }
        if !bids.is_empty() {
            self.commit_tail();
        }
    }

    fn push(&mut self, bid: u16) {
        assert!(bid < self.entries, "buffer id {bid} out of range");
        let at = (self.tail & self.mask) as usize * Self::ENTRY_SIZE;
        let addr = unsafe { self.backing.as_ptr().add(bid as usize * self.buf_size as usize) };
        // Field stores only: entry 0's resv overlays the shared tail and
        // must never be written from here.
        unsafe {
            let entry = self.ring_ptr.add(at).cast::<sys::io_uring_buf>();
            (*entry).addr = addr as u64;
            (*entry).len = self.buf_size;
            (*entry).bid = bid;
        }
        self.tail = self.tail.wrapping_add(1);
    }

    fn commit_tail(&self) {
        // Release: entry writes must be visible before the kernel observes
        // the new tail.
        let tail_ptr = unsafe { self.ring_ptr.add(Self::TAIL_OFFSET).cast::<AtomicU16>() };
        unsafe { (*tail_ptr).store(self.tail, Ordering::Release) };
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        if !self.ring_ptr.is_null() {
            unsafe {
                libc::munmap(self.ring_ptr as *mut _, self.ring_mmap_len);
            }
        }
    }
}

// Safety: the mapping and backing are owned by this value; userspace
// access is single-threaded by the owning ring's contract.
unsafe impl Send for BufferRing {}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(ring: &BufferRing, index: usize) -> sys::io_uring_buf {
        unsafe {
            ptr::read(
                ring.ring_ptr
                    .add(index * BufferRing::ENTRY_SIZE)
                    .cast::<sys::io_uring_buf>(),
            )
        }
    }

    fn shared_tail(ring: &BufferRing) -> u16 {
        let tail_ptr = unsafe {
            ring.ring_ptr
                .add(BufferRing::TAIL_OFFSET)
                .cast::<AtomicU16>()
        };
        unsafe { (*tail_ptr).load(Ordering::Acquire) }
    }

    #[test]
    fn group_rounds_sizes_up() {
        let group = BufferGroup::new(1, 5, 1000).unwrap();
        assert_eq!(group.buffer_count(), 8);
        assert_eq!(group.buf_size(), 1024);

        let (first, len) = group.buffer(0);
        let (second, _) = group.buffer(1);
        assert_eq!(len, 1024);
        assert_eq!(second as usize - first as usize, 1024);
    }

    #[test]
    fn group_rejects_zero_sizes() {
        assert!(BufferGroup::new(0, 0, 1024).is_err());
        assert!(BufferGroup::new(0, 4, 0).is_err());
    }

    #[test]
    fn ring_prefills_every_buffer() {
        let ring = BufferRing::new(3, 4, 512).unwrap();
        assert_eq!(ring.entries(), 4);
        assert_eq!(shared_tail(&ring), 4);

        for bid in 0..4u16 {
            let entry = entry_at(&ring, bid as usize);
            let (ptr, len) = ring.buffer(bid);
            assert_eq!(entry.addr, ptr as u64);
            assert_eq!(entry.len, len);
            assert_eq!(entry.bid, bid);
        }
    }

    #[test]
    fn replenish_wraps_and_publishes() {
        let mut ring = BufferRing::new(0, 4, 256).unwrap();
        ring.replenish(2);
        assert_eq!(shared_tail(&ring), 5);
        // Tail 4 wrapped to slot 0.
        assert_eq!(entry_at(&ring, 0).bid, 2);

        ring.replenish_batch(&[0, 1]);
        assert_eq!(shared_tail(&ring), 7);
        assert_eq!(entry_at(&ring, 1).bid, 0);
        assert_eq!(entry_at(&ring, 2).bid, 1);

        ring.replenish_batch(&[]);
        assert_eq!(shared_tail(&ring), 7);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn replenish_rejects_an_out_of_range_id() {
        // Entry addresses are computed from the id; an id past the pool
        // must never reach the kernel-visible ring.
        let mut ring = BufferRing::new(5, 4, 256).unwrap();
        ring.replenish(9);
    }

    #[test]
    fn leaked_group_backing_stays_allocated() {
        let group = BufferGroup::new(1, 4, 256).unwrap();
        let base = group.leak();
        unsafe { base.write(0xA5) };
        assert_eq!(unsafe { base.read() }, 0xA5);
    }

    #[test]
    fn ring_rounds_entries_up() {
        let ring = BufferRing::new(9, 3, 128).unwrap();
        assert_eq!(ring.entries(), 4);
        assert_eq!(ring.buf_size(), 128);
    }
}
