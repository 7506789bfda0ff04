//! Host virtual memory backends.
//!
//! This module hides the per-OS virtual memory APIs behind the [`Backend`] trait so that
//! the block layer never branches on the host platform. One implementation exists per OS
//! family and is selected once, at first use:
//!
//! - `unix` - `mmap` family via `libc`; shareable objects are `memfd_create` file
//!   descriptors on Linux and unlinked `shm_open` objects elsewhere
//! - `windows` - `VirtualAlloc2` placeholder reservations with `MapViewOfFile3` /
//!   `UnmapViewOfFile2` view replacement
//! - Anything else - every operation reports [`UnsupportedOnPlatform`](crate::Error::UnsupportedOnPlatform)
//!
//! # Mapping-object economy
//!
//! Remapping is implemented by retargeting page ranges in place: exactly one kernel
//! object (a file descriptor or a section handle) exists per shareable backing store,
//! and mapping a view never allocates another one. Kernel-side mapping records stay
//! proportional to the *live* fragmentation of a reservation, never to the number of
//! map/unmap calls performed, which is what keeps tens of thousands of remap cycles
//! inside OS per-process mapping limits.

use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::Result;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;
#[cfg(not(any(unix, windows)))]
mod unsupported;

#[cfg(unix)]
pub(crate) use unix::ShareableMemory;
#[cfg(windows)]
pub(crate) use windows::ShareableMemory;
#[cfg(not(any(unix, windows)))]
pub(crate) use unsupported::ShareableMemory;

/// Backend trait for host virtual memory management.
///
/// This trait abstracts over the capability set the block layer needs: reserve address
/// space, commit and decommit pages, create a shareable backing object, map a view of
/// such an object at a fixed address, revert a view range to private memory and release
/// a reservation. All implementations must be thread-safe; serialization of structural
/// changes to a single reservation is the caller's responsibility.
///
/// All sizes, offsets and lengths are in bytes and must be multiples of
/// [`page_size`](Backend::page_size); the block layer validates this before calling in.
pub(crate) trait Backend: Send + Sync {
    /// Returns the allocation granularity of the host, in bytes.
    fn page_size(&self) -> u64;

    /// Allocates `size` bytes of private, immediately committed, readable and writable
    /// memory.
    fn alloc(&self, size: u64) -> Result<NonNull<u8>>;

    /// Reserves `size` bytes of address space without committing any physical memory.
    ///
    /// When `view_compatible` is set the reservation is prepared so that page-aligned
    /// sub-ranges can later be individually retargeted with
    /// [`map_view`](Backend::map_view).
    fn reserve(&self, size: u64, view_compatible: bool) -> Result<NonNull<u8>>;

    /// Commits `length` bytes at `base + offset` inside a reserved range, making them
    /// readable, writable and zero-filled.
    fn commit(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()>;

    /// Decommits `length` bytes at `base + offset`, returning the pages to the reserved
    /// state and releasing their physical backing.
    fn decommit(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()>;

    /// Creates a shareable memory object of `size` bytes.
    fn create_shareable(&self, size: u64) -> Result<ShareableMemory>;

    /// Maps the whole of `shareable` into the address space and returns the base of the
    /// mapping. Used for the owning block of a shareable object, which must be directly
    /// readable and writable.
    fn map_shareable(&self, shareable: &ShareableMemory, size: u64) -> Result<NonNull<u8>>;

    /// Maps `length` bytes of `shareable`, starting at `src_offset`, onto
    /// `base + offset` inside a view-compatible reservation. Whatever occupied the
    /// target range before is replaced.
    fn map_view(
        &self,
        shareable: &ShareableMemory,
        src_offset: u64,
        base: NonNull<u8>,
        offset: u64,
        length: u64,
    ) -> Result<()>;

    /// Reverts `length` bytes at `base + offset` from an active view to private,
    /// zero-filled, committed memory that shares nothing with the former source.
    ///
    /// The caller guarantees the range is currently view-mapped.
    fn unmap_view(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()>;

    /// Unmaps the whole-object mapping created by [`map_shareable`](Backend::map_shareable).
    fn unmap_shareable(&self, base: NonNull<u8>, size: u64) -> Result<()>;

    /// Releases a reservation created by [`alloc`](Backend::alloc) or
    /// [`reserve`](Backend::reserve), tearing down any views still mapped inside it.
    fn release(&self, base: NonNull<u8>, size: u64) -> Result<()>;
}

/// Returns the backend for the host OS family.
pub(crate) fn host() -> &'static dyn Backend {
    #[cfg(unix)]
    {
        static HOST: unix::Posix = unix::Posix;
        &HOST
    }

    #[cfg(windows)]
    {
        static HOST: windows::Win32 = windows::Win32::new();
        &HOST
    }

    #[cfg(not(any(unix, windows)))]
    {
        static HOST: unsupported::Unsupported = unsupported::Unsupported;
        &HOST
    }
}

/// Returns the size of a host memory page in bytes.
///
/// Every offset and length passed to a mapping operation must be a multiple of this
/// value. The value is queried from the OS once and cached.
///
/// # Examples
///
/// ```rust
/// let page = vmview::page_size();
/// assert!(page.is_power_of_two());
/// ```
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| host().page_size())
}
