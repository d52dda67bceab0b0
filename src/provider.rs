//! The page provider is an external collaborator: it owns every
//! interaction with the operating system's virtual memory primitives.
//! Keeping it behind a trait means the slab engine and region
//! registry never call `mmap` directly, and a test harness can swap
//! in a provider that tracks every reservation for `check_rep`-style
//! auditing.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Reserves, commits, protects, and releases page-aligned ranges of
/// address space.
pub(crate) trait PageProvider: std::fmt::Debug + Sync {
    /// The mapping granularity for this provider. Constant for the
    /// lifetime of the process.
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes of address space at an OS-chosen
    /// address. The range is inaccessible until committed with
    /// [`PageProvider::protect_rw`].
    fn map(&self, size: usize) -> Result<NonNull<c_void>>;

    /// Drops any commitment in `[addr, addr + size)` while keeping
    /// the reservation, so a later `protect_rw` can bring it back.
    fn map_fixed(&self, addr: NonNull<c_void>, size: usize) -> Result<()>;

    /// Makes a reserved or committed range readable and writable.
    fn protect_rw(&self, addr: NonNull<c_void>, size: usize) -> Result<()>;

    /// Makes a committed range read-only.
    fn protect_ro(&self, addr: NonNull<c_void>, size: usize) -> Result<()>;

    /// Allocates a committed, read-write range of `size` bytes with
    /// `guard_size` bytes of inaccessible pages on both sides.
    /// Returns the inner (data) pointer.
    fn pages(&self, size: usize, guard_size: usize, randomize: bool) -> Result<NonNull<c_void>>;

    /// Like [`PageProvider::pages`], but the inner range is also
    /// aligned to `align` bytes.
    fn pages_aligned(&self, size: usize, align: usize, guard_size: usize)
        -> Result<NonNull<c_void>>;

    /// Releases a range, including its guard pages, back to the OS.
    /// `addr` must be a pointer previously returned by `pages` /
    /// `pages_aligned`, and `size` the data size passed to that call.
    fn unmap(&self, addr: NonNull<c_void>, size: usize) -> Result<()>;

    /// Attempts to move `[old, old + old_size)` to
    /// `[new, new + new_size)` without copying. `new` must already be
    /// reserved (typically by a prior `pages` call whose data was
    /// never committed). Returns `Err` if the platform can't do this;
    /// callers fall back to an explicit copy.
    fn remap_fixed(
        &self,
        old: NonNull<c_void>,
        old_size: usize,
        new: NonNull<c_void>,
        new_size: usize,
    ) -> Result<()>;
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_round(n: usize, page_size: usize) -> usize {
    (n + page_size - 1) & !(page_size - 1)
}

/// The default [`PageProvider`], backed by POSIX `mmap`/`mprotect`.
#[derive(Debug)]
pub(crate) struct MmapProvider;

impl MmapProvider {
    pub fn new() -> Self {
        MmapProvider
    }

    fn reserve_raw(&self, size: usize) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Provider(errno()));
        }

        Ok(NonNull::new(ptr).expect("mmap does not return NULL on success"))
    }

    /// Releases a page-aligned sub-range of an over-reservation back
    /// to the OS entirely (no reservation kept, unlike `map_fixed`).
    fn trim_reservation(&self, addr: usize, size: usize) -> Result<()> {
        let ret = unsafe { libc::munmap(addr as *mut c_void, size) };
        if ret != 0 {
            return Err(Error::Provider(errno()));
        }
        Ok(())
    }
}

impl PageProvider for MmapProvider {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf(_SC_PAGESIZE) has no documented failure
        // mode on the platforms this crate targets.
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
        ret as usize
    }

    fn map(&self, size: usize) -> Result<NonNull<c_void>> {
        assert_eq!(size % self.page_size(), 0, "map: size must be page-aligned");
        self.reserve_raw(size)
    }

    fn map_fixed(&self, addr: NonNull<c_void>, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        assert_eq!(size % self.page_size(), 0, "map_fixed: size must be page-aligned");

        // Overlay a fresh, inaccessible anonymous mapping: this drops
        // any commitment (the kernel is free to reclaim the physical
        // pages) while leaving the address range reserved for reuse.
        let ptr = unsafe {
            libc::mmap(
                addr.as_ptr(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Provider(errno()));
        }

        Ok(())
    }

    fn protect_rw(&self, addr: NonNull<c_void>, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let ret =
            unsafe { libc::mprotect(addr.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) };
        if ret != 0 {
            return Err(Error::Provider(errno()));
        }
        Ok(())
    }

    fn protect_ro(&self, addr: NonNull<c_void>, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let ret = unsafe { libc::mprotect(addr.as_ptr(), size, libc::PROT_READ) };
        if ret != 0 {
            return Err(Error::Provider(errno()));
        }
        Ok(())
    }

    fn pages(&self, size: usize, guard_size: usize, _randomize: bool) -> Result<NonNull<c_void>> {
        // The kernel already places anonymous mmaps at an ASLR'd
        // base; `randomize` is accepted for interface fidelity with
        // the design, which additionally randomizes placement within
        // its own pre-reserved arenas (see `slab_region`).
        self.pages_aligned(size, self.page_size(), guard_size)
    }

    fn pages_aligned(
        &self,
        size: usize,
        align: usize,
        guard_size: usize,
    ) -> Result<NonNull<c_void>> {
        let page_size = self.page_size();
        let rounded_size = page_round(size, page_size);
        let rounded_guard = page_round(guard_size, page_size);

        // Over-reserve by one alignment unit so we can carve out an
        // aligned interior no matter where the kernel puts the base,
        // then immediately release the unused prefix/suffix slack: the
        // mapping left standing is exactly `[data - guard, data + size
        // + guard)`, matching what `unmap` expects to release later.
        let total = rounded_size
            .checked_add(2 * rounded_guard)
            .and_then(|n| n.checked_add(align))
            .ok_or(Error::SizeOverflow)?;
        let total_rounded = page_round(total, page_size);

        let base = self.reserve_raw(total_rounded)?;
        let base_addr = base.as_ptr() as usize;

        let mut data_addr = base_addr + rounded_guard;
        let misalignment = data_addr % align;
        if misalignment != 0 {
            data_addr += align - misalignment;
        }

        let outer_start = data_addr - rounded_guard;
        let outer_end = data_addr + rounded_size + rounded_guard;

        let front_slack = outer_start - base_addr;
        if front_slack > 0 {
            self.trim_reservation(base_addr, front_slack)?;
        }
        let back_slack = (base_addr + total_rounded) - outer_end;
        if back_slack > 0 {
            self.trim_reservation(outer_end, back_slack)?;
        }

        let data_ptr = NonNull::new(data_addr as *mut c_void).expect("non-null by construction");
        self.protect_rw(data_ptr, rounded_size)?;

        Ok(data_ptr)
    }

    /// Unmaps `[addr, addr + size)`, the *exact* outer span (data plus
    /// both guard regions) a caller received by composing `guard_size`
    /// with the value returned from `pages`/`pages_aligned`; the
    /// provider itself does not remember guard sizes, so it is the
    /// caller's job to pass the true outer span here.
    fn unmap(&self, addr: NonNull<c_void>, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let page_size = self.page_size();
        let rounded = page_round(size, page_size);
        let ret = unsafe { libc::munmap(addr.as_ptr(), rounded) };
        if ret != 0 {
            return Err(Error::Provider(errno()));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn remap_fixed(
        &self,
        old: NonNull<c_void>,
        old_size: usize,
        new: NonNull<c_void>,
        new_size: usize,
    ) -> Result<()> {
        let ret = unsafe {
            libc::mremap(
                old.as_ptr(),
                old_size,
                new_size,
                libc::MREMAP_FIXED | libc::MREMAP_MAYMOVE,
                new.as_ptr(),
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(Error::Provider(errno()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn remap_fixed(
        &self,
        _old: NonNull<c_void>,
        _old_size: usize,
        _new: NonNull<c_void>,
        _new_size: usize,
    ) -> Result<()> {
        // No portable remap-without-copy primitive off Linux; callers
        // treat this as a signal to fall back to an explicit copy.
        Err(Error::Provider(libc::ENOTSUP))
    }
}

/// Returns the process-wide default provider.
pub(crate) fn default_provider() -> &'static dyn PageProvider {
    lazy_static::lazy_static! {
        static ref PROVIDER: MmapProvider = MmapProvider::new();
    }

    &*PROVIDER
}

/// Maps a temporary, unlinked file of `size` bytes into
/// `[addr, addr + size)`, used for the optional file-backed
/// large-allocation path (see `SLAB_BACKING_DIR`). The file lives
/// only as long as the mapping: once every mapping of it is gone, the
/// space is reclaimed, matching the anonymous-mapping path's
/// lifetime.
pub(crate) fn map_file_backed(
    addr: NonNull<c_void>,
    size: usize,
    dir: &std::path::Path,
) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let file = tempfile::tempfile_in(dir).map_err(|e| Error::Provider(e.raw_os_error().unwrap_or(0)))?;
    file.set_len(size as u64)
        .map_err(|e| Error::Provider(e.raw_os_error().unwrap_or(0)))?;

    let ptr = unsafe {
        libc::mmap(
            addr.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(Error::Provider(errno()));
    }

    // The fd is no longer needed once mmap has taken its own
    // reference to the underlying file; the mapping keeps the data
    // alive.
    drop(file);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_reasonable() {
        let provider = MmapProvider::new();
        let page_size = provider.page_size();
        assert!(page_size > 0);
        assert_eq!(page_size & (page_size - 1), 0, "page size must be a power of two");
    }

    #[test]
    fn map_then_unmap_roundtrips() {
        let provider = MmapProvider::new();
        let page_size = provider.page_size();
        let ptr = provider.map(page_size * 4).expect("map should succeed");
        provider.protect_rw(ptr, page_size).expect("protect_rw should succeed");

        unsafe {
            std::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0x42, page_size);
        }

        provider
            .unmap(ptr, page_size * 4)
            .expect("unmap should succeed");
    }

    #[test]
    fn pages_carves_guarded_aligned_range() {
        let provider = MmapProvider::new();
        let page_size = provider.page_size();
        let data = provider
            .pages_aligned(page_size, page_size, page_size)
            .expect("pages_aligned should succeed");

        assert_eq!(data.as_ptr() as usize % page_size, 0);

        unsafe {
            std::ptr::write_bytes(data.as_ptr() as *mut u8, 1, page_size);
        }
    }
}
