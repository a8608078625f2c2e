//! Guest memory arena.
//!
//! Owns a single 4 GiB virtual reservation that stands in for the Xenon's
//! guest address space. Guest addresses are 32-bit offsets into this
//! reservation; translation is `arena_base + guest_addr`, nothing more —
//! there are no guest page tables, only host-enforced commit state.
//!
//! The reservation is made with `PROT_NONE` up front and grown page by page
//! via `mprotect`, mirroring how a real console emulator keeps the whole
//! 32-bit space addressable while only backing the parts a title actually
//! uses. `mmap-rs` (used elsewhere in this workspace for one-shot
//! executable allocations) models each mapping as a single owned handle and
//! doesn't expose in-place re-protection of a sub-range of an existing
//! reservation, which is exactly what committing/decommitting a page range
//! inside one 4 GiB reservation needs — so the arena talks to `mmap`/
//! `mprotect`/`munmap` directly through `libc` instead.

mod error;
mod region;

pub use error::ArenaError;
pub use region::{AccessMode, ArenaRegion};

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Size of the guest address space: exactly 4 GiB.
pub const ARENA_SIZE: u64 = 1 << 32;

/// Process-wide guard: the arena must be reserved at most once per process.
static RESERVED: AtomicBool = AtomicBool::new(false);

/// A single reserved 4 GiB guest address space.
///
/// There is at most one live `GuestArena` per process — `initialize`
/// enforces this with a one-shot atomic flag, matching the "init-once,
/// process-wide" lifecycle the core design calls for.
pub struct GuestArena {
    base: NonNull<u8>,
    page_size: u64,
    size: u64,
}

// SAFETY: the arena only ever changes protection of pages it owns via
// syscalls that are themselves thread-safe; callers are responsible for
// serialising overlapping commit/decommit/protect calls per the documented
// concurrency contract.
unsafe impl Send for GuestArena {}
unsafe impl Sync for GuestArena {}

impl GuestArena {
    /// Reserve the 4 GiB guest address space with no backing (`NoAccess`).
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::AlreadyInitialized`] if a `GuestArena` already
    /// exists in this process, or [`ArenaError::Reserve`] if the host
    /// refuses the reservation.
    pub fn initialize() -> Result<Self, ArenaError> {
        Self::initialize_with_size(ARENA_SIZE)
    }

    /// Reserve `size` bytes of guest address space instead of the full
    /// 4 GiB — used by tests that want a smaller reservation than the
    /// production default. `size` is rounded up to a whole page.
    ///
    /// # Errors
    ///
    /// Same as [`Self::initialize`].
    pub fn initialize_with_size(size: u64) -> Result<Self, ArenaError> {
        if RESERVED.swap(true, Ordering::AcqRel) {
            return Err(ArenaError::AlreadyInitialized);
        }

        let page_size = host_page_size();
        let size = round_up(size, page_size);
        // SAFETY: a fixed-size anonymous, non-backed, non-fixed mapping;
        // the returned pointer is only used as an opaque base by this type.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as libc::size_t,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            RESERVED.store(false, Ordering::Release);
            return Err(ArenaError::Reserve(std::io::Error::last_os_error()));
        }

        // SAFETY: mmap succeeded, ptr is non-null by construction above.
        let base = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
        log::info!("guest arena reserved: {size:#x} bytes at {base:p}");
        Ok(Self { base, page_size, size })
    }

    /// Release the reservation. Equivalent to dropping the arena.
    pub fn shutdown(self) {
        drop(self);
    }

    /// Host pointer to guest address zero.
    #[must_use]
    pub fn arena_base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Translate a guest address into a host pointer.
    ///
    /// Pure offset arithmetic; does not check commit state. Accessing the
    /// result when the backing page is `NoAccess` or not yet committed
    /// raises a host signal, which this crate neither installs a handler
    /// for nor catches.
    #[must_use]
    pub fn translate(&self, guest_addr: u32) -> *mut u8 {
        // SAFETY: offset stays within the 4 GiB reservation for any u32.
        unsafe { self.base.as_ptr().add(guest_addr as usize) }
    }

    /// Round `(guest_addr, size)` to host page granularity and validate
    /// that it lies inside the reservation.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::OutOfRange`] if the region extends past the
    /// 4 GiB reservation.
    pub fn reserve(&self, guest_addr: u32, size: u64) -> Result<ArenaRegion, ArenaError> {
        let region = ArenaRegion::page_align(guest_addr, size, self.page_size);
        let end = u64::from(region.guest_addr) + region.size;
        if end > self.size {
            return Err(ArenaError::OutOfRange { guest_addr, size });
        }
        Ok(region)
    }

    /// Commit `region` with the given access. First access after commit
    /// observes zero-filled memory — anonymous `mmap`-backed pages are
    /// zero-filled by the host kernel on first touch, so this falls out of
    /// `mprotect` alone; no explicit zeroing pass is required.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Protect`] if the host refuses the transition.
    pub fn commit(&self, region: ArenaRegion, access: AccessMode) -> Result<(), ArenaError> {
        self.mprotect_region(region, access)
    }

    /// Decommit `region`: drop physical backing but keep the reservation.
    /// Implemented as `MADV_DONTNEED` (return pages to the kernel) followed
    /// by an `mprotect` to `NoAccess`; the next `commit` zero-fills again.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Protect`] if either step fails.
    pub fn decommit(&self, region: ArenaRegion) -> Result<(), ArenaError> {
        let ptr = self.translate(region.guest_addr);
        // SAFETY: ptr/size describe a sub-range of the owned reservation.
        let rc = unsafe { libc::madvise(ptr.cast(), region.size as libc::size_t, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(ArenaError::Protect(std::io::Error::last_os_error()));
        }
        self.mprotect_region(region, AccessMode::NoAccess)
    }

    /// Change access for an already-committed region without discarding
    /// its contents.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Protect`] if the host refuses the transition.
    pub fn protect(&self, region: ArenaRegion, access: AccessMode) -> Result<(), ArenaError> {
        self.mprotect_region(region, access)
    }

    /// Return a region to `NoAccess` and `MADV_DONTNEED` its backing —
    /// symmetric with `decommit`, kept as a distinct name to match the
    /// documented operation list.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Protect`] if the release fails.
    pub fn release(&self, region: ArenaRegion) -> Result<(), ArenaError> {
        self.decommit(region)
    }

    /// Allocate a standalone read-write-execute host region outside the
    /// guest arena, for JIT code that isn't addressed by a guest address.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Reserve`] if the host allocator is out of
    /// memory.
    pub fn allocate_executable(&self, size: u64) -> Result<ExecutableRegion, ArenaError> {
        let size = round_up(size, self.page_size);
        // SAFETY: anonymous, non-fixed mapping; ownership transferred to
        // the returned `ExecutableRegion`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::Reserve(std::io::Error::last_os_error()));
        }
        Ok(ExecutableRegion {
            ptr: ptr.cast(),
            size,
        })
    }

    /// Free a region previously returned by [`Self::allocate_executable`].
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Protect`] if `munmap` fails.
    pub fn free_executable(&self, region: ExecutableRegion) -> Result<(), ArenaError> {
        // SAFETY: region was produced by allocate_executable and is not
        // used again after this call (it is consumed by value).
        let rc = unsafe { libc::munmap(region.ptr.cast(), region.size as libc::size_t) };
        if rc != 0 {
            return Err(ArenaError::Protect(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn mprotect_region(&self, region: ArenaRegion, access: AccessMode) -> Result<(), ArenaError> {
        let ptr = self.translate(region.guest_addr);
        // SAFETY: ptr/size describe a sub-range of the owned reservation.
        let rc = unsafe { libc::mprotect(ptr.cast(), region.size as libc::size_t, access.to_prot()) };
        if rc != 0 {
            return Err(ArenaError::Protect(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for GuestArena {
    fn drop(&mut self) {
        // SAFETY: base/size describe the exact reservation made in
        // `initialize`/`initialize_with_size`; no other code holds a
        // `GuestArena` for this range.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.size as libc::size_t);
        }
        RESERVED.store(false, Ordering::Release);
    }
}

/// A standalone executable allocation outside the guest arena.
pub struct ExecutableRegion {
    ptr: *mut u8,
    size: u64,
}

impl ExecutableRegion {
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn host_page_size() -> u64 {
    // SAFETY: sysconf with a well-known name, no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 { 4096 } else { page_size as u64 }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `GuestArena::initialize` is process-wide and single-instance, so
    // tests that exercise it must not run concurrently.
    static LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn initialize_reserves_4gib() {
        let _guard = LOCK.lock().unwrap();
        let arena = GuestArena::initialize().expect("reserve");
        assert!(!arena.arena_base().is_null());
        assert_eq!(ARENA_SIZE, 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn second_initialize_fails_while_first_lives() {
        let _guard = LOCK.lock().unwrap();
        let arena = GuestArena::initialize().expect("reserve");
        let err = GuestArena::initialize().unwrap_err();
        assert!(matches!(err, ArenaError::AlreadyInitialized));
        drop(arena);
    }

    #[test]
    fn translate_is_base_plus_offset() {
        let _guard = LOCK.lock().unwrap();
        let arena = GuestArena::initialize().expect("reserve");
        let base = arena.arena_base();
        // SAFETY: pointer arithmetic only, never dereferenced.
        let expected = unsafe { base.add(0x1000) };
        assert_eq!(arena.translate(0x1000), expected);
    }

    #[test]
    fn commit_then_readwrite_roundtrip() {
        let _guard = LOCK.lock().unwrap();
        let arena = GuestArena::initialize().expect("reserve");
        let region = arena.reserve(0x1_0000, 0x1000).expect("region");
        arena.commit(region, AccessMode::ReadWrite).expect("commit");
        let ptr = arena.translate(0x1_0000);
        // SAFETY: just-committed read-write page.
        unsafe {
            *ptr = 0xAB;
            assert_eq!(*ptr, 0xAB);
        }
    }

    #[test]
    fn reserve_rejects_out_of_range() {
        let _guard = LOCK.lock().unwrap();
        let arena = GuestArena::initialize().expect("reserve");
        let err = arena.reserve(u32::MAX - 10, 4096).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfRange { .. }));
    }

    #[test]
    fn initialize_with_size_rejects_regions_past_the_smaller_bound() {
        let _guard = LOCK.lock().unwrap();
        let arena = GuestArena::initialize_with_size(64 * 1024).expect("reserve small");
        arena.reserve(0, 4096).expect("in range");
        let err = arena.reserve(1024 * 1024, 4096).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfRange { .. }));
    }
}
