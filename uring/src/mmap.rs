//! Owned memory mappings of the kernel-shared ring regions.

use std::io;
use std::ptr;

/// One mmap'd region of a ring file descriptor (SQ ring, SQE array, or CQ
/// ring), unmapped on drop.
///
/// The region is the sole owner of the pages; everything else in the crate
/// holds non-owning pointers computed from [`as_ptr`](Self::as_ptr) plus the
/// offsets the kernel reported at setup, and must not outlive the region.
pub(crate) struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes of `fd` at the given ring offset, read-write, shared,
    /// and pre-faulted.
    pub(crate) fn map(fd: libc::c_int, len: usize, offset: u64) -> io::Result<Self> {
        // Safety: the kernel validates fd/offset/len against the ring it
        // created; MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Keep this mapping out of forked children.
    pub(crate) fn dont_fork(&self) -> io::Result<()> {
        // Safety: the range is exactly this mapping.
        let ret = unsafe {
            libc::madvise(self.ptr as *mut libc::c_void, self.len, libc::MADV_DONTFORK)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // Safety: ptr/len are exactly what mmap returned.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

// Safety: the mapping is plain memory; access discipline (who reads or
// writes which word, with which ordering) is enforced by the queue types
// holding pointers into it.
unsafe impl Send for MappedRegion {}
