//! Page-level virtual memory driver.
//!
//! The heap touches the operating system exclusively through the
//! [`VirtualMemory`] trait: reserve address space, commit and decommit page
//! ranges, release the reservation. Keeping the OS behind this seam lets the
//! rest of the allocator be exercised against an in-process simulation in
//! tests.
//!
//! [`OsMemory`] is the POSIX implementation (`mmap` / `mprotect` /
//! `madvise`). Failures of anything but the initial reservation indicate a
//! broken process-level invariant or exhausted address space and are treated
//! as fatal.

use std::io;
use std::ptr::NonNull;

use crate::PAGE_SIZE;

/// Driver for whole-page virtual memory ranges.
///
/// All byte counts are multiples of [`PAGE_SIZE`] and all pointers are
/// page-aligned addresses inside a range previously returned by
/// [`reserve`](Self::reserve).
///
/// # Safety
///
/// Implementations must uphold the page protection contract: memory is not
/// readable or writable until committed, `decommit` makes a range fault on
/// the next access and forgets its contents (a later `commit` must not
/// resurrect them), and `release` invalidates the entire reservation.
pub unsafe trait VirtualMemory {
    /// Reserves `bytes` of address space with no access rights and no
    /// backing store.
    ///
    /// Returns `None` if the reservation is refused; this is the only
    /// survivable driver failure.
    fn reserve(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// Returns an entire reservation to the OS.
    ///
    /// # Safety
    ///
    /// `base` and `bytes` must exactly describe a live range obtained from
    /// [`reserve`](Self::reserve) on this driver. No pointer into the range
    /// may be used afterwards.
    unsafe fn release(&mut self, base: NonNull<u8>, bytes: usize);

    /// Makes a sub-range readable and writable.
    ///
    /// # Safety
    ///
    /// The range must lie within a live reservation from this driver.
    unsafe fn commit(&mut self, ptr: NonNull<u8>, bytes: usize);

    /// Makes a sub-range inaccessible and drops its physical backing.
    ///
    /// The pages must fault on the next access, and their old contents must
    /// not be observable through a subsequent commit.
    ///
    /// # Safety
    ///
    /// The range must lie within a live reservation from this driver.
    unsafe fn decommit(&mut self, ptr: NonNull<u8>, bytes: usize);
}

/// The real OS driver, backed by anonymous private mappings.
///
/// Reservation maps the range `PROT_NONE` so it occupies address space
/// without being dereferenceable; commit and decommit flip page rights with
/// `mprotect`, and decommit additionally drops physical backing via
/// `madvise(MADV_DONTNEED)`.
#[derive(Debug, Default)]
pub struct OsMemory;

impl OsMemory {
    /// Creates the OS driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

// SAFETY: PROT_NONE reservations fault until committed; MADV_DONTNEED plus
// PROT_NONE (with an explicit scrub where DONTNEED does not discard) meets
// the decommit contract.
unsafe impl VirtualMemory for OsMemory {
    fn reserve(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert!(bytes > 0 && bytes % PAGE_SIZE == 0);
        // SAFETY: anonymous private mapping, no fd, OS-chosen address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            tracing::debug!(
                bytes,
                error = %io::Error::last_os_error(),
                "address space reservation refused"
            );
            return None;
        }
        NonNull::new(ptr.cast())
    }

    unsafe fn release(&mut self, base: NonNull<u8>, bytes: usize) {
        // SAFETY: caller guarantees base/bytes describe the live reservation.
        let rc = unsafe { libc::munmap(base.as_ptr().cast(), bytes) };
        assert!(
            rc == 0,
            "failed to release reservation: {}",
            io::Error::last_os_error()
        );
    }

    unsafe fn commit(&mut self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: caller guarantees the range lies within the reservation.
        let rc = unsafe {
            libc::mprotect(ptr.as_ptr().cast(), bytes, libc::PROT_READ | libc::PROT_WRITE)
        };
        assert!(
            rc == 0,
            "failed to commit memory: {}",
            io::Error::last_os_error()
        );
    }

    unsafe fn decommit(&mut self, ptr: NonNull<u8>, bytes: usize) {
        // MADV_DONTNEED only guarantees content loss for anonymous private
        // mappings on Linux; elsewhere the range is scrubbed by hand first.
        #[cfg(not(target_os = "linux"))]
        // SAFETY: caller guarantees the range lies within the reservation;
        // it is made writable for the scrub and protected again below.
        unsafe {
            let rc = libc::mprotect(
                ptr.as_ptr().cast(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            assert!(
                rc == 0,
                "failed to unprotect memory for scrub: {}",
                io::Error::last_os_error()
            );
            std::ptr::write_bytes(ptr.as_ptr(), 0, bytes);
        }

        // SAFETY: caller guarantees the range lies within the reservation.
        let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), bytes, libc::MADV_DONTNEED) };
        assert!(
            rc == 0,
            "madvise(MADV_DONTNEED) failed: {}",
            io::Error::last_os_error()
        );
        // SAFETY: as above.
        let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), bytes, libc::PROT_NONE) };
        assert!(
            rc == 0,
            "failed to decommit memory: {}",
            io::Error::last_os_error()
        );
    }
}
