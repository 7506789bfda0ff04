//! POSIX backend built on the `mmap` family.
//!
//! Reservations are `PROT_NONE` anonymous mappings, commits are `mprotect` upgrades and
//! shareable backing stores are anonymous file descriptors: `memfd_create` on Linux,
//! an unlinked `shm_open` object on other POSIX systems. A view is mapped by calling
//! `mmap` with `MAP_SHARED | MAP_FIXED` over the destination range, which atomically
//! replaces whatever was there; unmapping a view replaces the range the same way with a
//! fresh `MAP_ANONYMOUS | MAP_PRIVATE` mapping.
//!
//! Because `MAP_FIXED` retargets ranges in place and the kernel merges adjacent
//! identical mappings, a map/unmap cycle leaves the process mapping count where it
//! found it. The only long-lived kernel object per backing store is its file
//! descriptor.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use super::Backend;
use crate::{Error, Result};

/// A shareable memory object usable as the source of view mappings.
///
/// Holds the owning file descriptor of the anonymous shared memory; the descriptor is
/// closed when the last block referencing the store drops it.
#[derive(Debug)]
pub(crate) struct ShareableMemory {
    fd: OwnedFd,
}

/// Backend implementation for POSIX hosts.
pub(crate) struct Posix;

fn os_error() -> Error {
    Error::AllocationFailed(io::Error::last_os_error())
}

impl Posix {
    fn mmap_anonymous(&self, size: u64, prot: libc::c_int, extra: libc::c_int) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(os_error());
        }

        Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
    }

    /// Creates the anonymous shared memory object backing a mirrorable block.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn create_shared_fd(&self, size: u64) -> Result<OwnedFd> {
        let raw = unsafe { libc::memfd_create(c"vmview-backing".as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(os_error());
        }

        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(os_error());
        }

        Ok(fd)
    }

    /// POSIX shared memory fallback for hosts without `memfd_create`.
    ///
    /// The object is unlinked immediately so it lives exactly as long as the
    /// descriptor.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn create_shared_fd(&self, size: u64) -> Result<OwnedFd> {
        use std::ffi::CString;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let name = format!(
            "/vmview-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let name = CString::new(name).expect("shm name contains no interior NUL");

        let raw = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(os_error());
        }

        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        unsafe { libc::shm_unlink(name.as_ptr()) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(os_error());
        }

        Ok(fd)
    }
}

impl Backend for Posix {
    fn page_size(&self) -> u64 {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
    }

    fn alloc(&self, size: u64) -> Result<NonNull<u8>> {
        self.mmap_anonymous(size, libc::PROT_READ | libc::PROT_WRITE, 0)
    }

    fn reserve(&self, size: u64, _view_compatible: bool) -> Result<NonNull<u8>> {
        // A PROT_NONE reservation is already view compatible: MAP_FIXED can replace
        // any sub-range of it.
        self.mmap_anonymous(size, libc::PROT_NONE, libc::MAP_NORESERVE)
    }

    fn commit(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
        let address = unsafe { base.as_ptr().add(offset as usize) };
        let result = unsafe {
            libc::mprotect(
                address.cast(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };

        if result != 0 {
            return Err(os_error());
        }
        Ok(())
    }

    fn decommit(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
        // Replacing the range with a fresh PROT_NONE mapping drops the physical pages
        // and returns the range to the reserved state in one step.
        let address = unsafe { base.as_ptr().add(offset as usize) };
        let ptr = unsafe {
            libc::mmap(
                address.cast(),
                length as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(os_error());
        }
        Ok(())
    }

    fn create_shareable(&self, size: u64) -> Result<ShareableMemory> {
        Ok(ShareableMemory {
            fd: self.create_shared_fd(size)?,
        })
    }

    fn map_shareable(&self, shareable: &ShareableMemory, size: u64) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                shareable.fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(os_error());
        }

        Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
    }

    fn map_view(
        &self,
        shareable: &ShareableMemory,
        src_offset: u64,
        base: NonNull<u8>,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let address = unsafe { base.as_ptr().add(offset as usize) };
        let ptr = unsafe {
            libc::mmap(
                address.cast(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                shareable.fd.as_raw_fd(),
                src_offset as libc::off_t,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(os_error());
        }
        Ok(())
    }

    fn unmap_view(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
        // Fresh anonymous pages: committed, zero-filled, sharing nothing with the
        // previous source.
        let address = unsafe { base.as_ptr().add(offset as usize) };
        let ptr = unsafe {
            libc::mmap(
                address.cast(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(os_error());
        }
        Ok(())
    }

    fn unmap_shareable(&self, base: NonNull<u8>, size: u64) -> Result<()> {
        self.release(base, size)
    }

    fn release(&self, base: NonNull<u8>, size: u64) -> Result<()> {
        if unsafe { libc::munmap(base.as_ptr().cast(), size as usize) } != 0 {
            return Err(os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_readable_and_writable() {
        let backend = Posix;
        let page = backend.page_size();

        let base = backend.alloc(page).unwrap();
        unsafe {
            base.as_ptr().cast::<u32>().write(0xDEAD_BEEF);
            assert_eq!(base.as_ptr().cast::<u32>().read(), 0xDEAD_BEEF);
        }

        backend.release(base, page).unwrap();
    }

    #[test]
    fn commit_makes_reserved_pages_accessible() {
        let backend = Posix;
        let page = backend.page_size();

        let base = backend.reserve(page * 4, false).unwrap();
        backend.commit(base, page, page).unwrap();

        unsafe {
            let ptr = base.as_ptr().add(page as usize).cast::<u64>();
            ptr.write(42);
            assert_eq!(ptr.read(), 42);
        }

        backend.decommit(base, page, page).unwrap();
        backend.release(base, page * 4).unwrap();
    }

    #[test]
    fn mapped_view_aliases_the_shared_pages() {
        let backend = Posix;
        let page = backend.page_size();

        let shareable = backend.create_shareable(page * 2).unwrap();
        let owner = backend.map_shareable(&shareable, page * 2).unwrap();
        let viewer = backend.reserve(page, true).unwrap();

        // Alias the second shared page into the viewer and check both directions.
        backend.map_view(&shareable, page, viewer, 0, page).unwrap();
        unsafe {
            viewer.as_ptr().cast::<u32>().write(0x1234_5678);
            let through_owner = owner.as_ptr().add(page as usize).cast::<u32>().read();
            assert_eq!(through_owner, 0x1234_5678);
        }

        // Reverting the view yields private zeroed pages.
        backend.unmap_view(viewer, 0, page).unwrap();
        unsafe {
            assert_eq!(viewer.as_ptr().cast::<u32>().read(), 0);
            viewer.as_ptr().cast::<u32>().write(0x9ABC_DEF0);
            let through_owner = owner.as_ptr().add(page as usize).cast::<u32>().read();
            assert_eq!(through_owner, 0x1234_5678);
        }

        backend.release(viewer, page).unwrap();
        backend.unmap_shareable(owner, page * 2).unwrap();
    }
}
