//! Virtual memory reservations backing each arena.
//!
//! A [`Reservation`] is one anonymous private mapping obtained from the
//! kernel up front. The arena that owns it never grows or shrinks the
//! mapping; it only advances its committed-heap watermark forward inside the
//! reserved range, so the kernel faults pages in lazily as the heap actually
//! reaches them. The mapping is returned to the kernel when the owning
//! allocator is dropped, which for the process-global pool means process
//! exit.

use core::ptr::NonNull;

use crate::InitError;

/// A contiguous anonymous mapping with a fixed base and length.
pub(crate) struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain process memory; the arena that owns the
// reservation only touches it while holding its lock.
unsafe impl Send for Reservation {}

impl Reservation {
    /// Reserve `len` bytes of address space from the kernel.
    ///
    /// The region is mapped readable and writable but remains untouched, so
    /// no physical memory is committed until the heap grows into it.
    pub(crate) fn new(len: usize) -> Result<Self, InitError> {
        // SAFETY: requesting a fresh anonymous private mapping has no
        // preconditions; the result is checked against MAP_FAILED below.
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            log::error!("mmap of {len} byte arena reservation failed (errno {errno})");
            return Err(InitError::MapFailed { errno });
        }

        // SAFETY: mmap never returns null on success.
        let base = unsafe { NonNull::new_unchecked(addr.cast()) };
        Ok(Self { base, len })
    }

    /// Lowest address of the reserved range.
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Total reserved bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: base/len describe exactly the mapping created in `new`,
        // and the owning arena is gone, so nothing references it anymore.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}
