//! Memory blocks: reservation, backing-store sharing and view mapping.
//!
//! This module provides [`MemoryBlock`], the public entity of the crate. A block owns a
//! page-aligned address-space reservation whose base address never changes for the
//! block's lifetime. Depending on its [`MemoryAllocationFlags`] it is either ordinary
//! private memory, a *backing* block whose pages live in a shareable
//! [`BackingStore`], or a *viewing* block whose pages can be individually retargeted
//! to alias a backing block's store.
//!
//! # Key Components
//!
//! - [`MemoryBlock`] - Allocation, typed and bulk access, view mapping, teardown
//! - [`MemoryAllocationFlags`] - Capability flags fixed at construction
//! - [`BackingStore`] - Reference-counted shareable memory behind mirrorable blocks
//! - [`table::ViewTable`] - Ordered record of the active view mappings of one block
//!
//! # View mapping
//!
//! Mapping a view makes a range of a viewing block resolve to the same physical pages
//! as a range of a backing block; writes through either block are mutually visible
//! until the range is unmapped. Mapping state changes which physical page an address
//! resolves to, never the address itself, so raw pointers handed out by
//! [`MemoryBlock::pointer`] stay valid across remaps.
//!
//! # Thread Safety
//!
//! Structural operations (map, unmap, commit, decommit) on one block serialize on the
//! block's view-table lock. Plain reads and writes are deliberately not serialized
//! against remaps: a racing access observes either the old or the new backing, which
//! matches what the hardware does during a live remap.

pub(crate) mod table;

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::backend::{self, ShareableMemory};
use crate::{Error, Result};
use table::{ViewMapping, ViewTable};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Capability flags of a [`MemoryBlock`], fixed at construction.
    ///
    /// The empty set allocates private, immediately committed memory. `MIRRORABLE`
    /// and `VIEW_COMPATIBLE` are mutually exclusive: a block is either the source or
    /// the target of aliasing, never both.
    pub struct MemoryAllocationFlags: u32 {
        /// Address space is reserved but not committed; no physical memory is
        /// consumed until ranges are committed or view mapped.
        const RESERVE = 1;
        /// The block is backed by a shareable memory object that other blocks may
        /// alias into. The block itself is committed and directly accessible.
        const MIRRORABLE = 1 << 1;
        /// Page-aligned sub-ranges of the block can later be individually remapped
        /// to alias a mirrorable block's backing store. Requires [`RESERVE`].
        ///
        /// [`RESERVE`]: MemoryAllocationFlags::RESERVE
        const VIEW_COMPATIBLE = 1 << 2;
    }
}

/// Shareable physical memory created for a mirrorable block.
///
/// Owned by the [`MemoryBlock`] that was allocated with
/// [`MemoryAllocationFlags::MIRRORABLE`]; every viewing block that currently maps a
/// view into it holds a non-owning reference through its view table. The underlying
/// OS object is destroyed when the last reference drops.
pub(crate) struct BackingStore {
    memory: ShareableMemory,
}

impl BackingStore {
    pub(crate) fn new(size: u64) -> Result<BackingStore> {
        Ok(BackingStore {
            memory: backend::host().create_shareable(size)?,
        })
    }
}

fn check_aligned(value: u64) -> Result<()> {
    let page_size = backend::page_size();
    if value % page_size != 0 {
        return Err(Error::MisalignedArgument { value, page_size });
    }
    Ok(())
}

fn check_range(offset: u64, length: u64, size: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange {
            offset,
            length,
            size,
        }),
    }
}

/// A page-granular range of virtual address space with optional backing-store
/// sharing and view mapping.
///
/// The base address returned by [`pointer`](MemoryBlock::pointer) is stable for the
/// block's entire lifetime; view mapping changes what physical memory an address
/// resolves to, never the address itself. All mapping operations work at page
/// granularity and validate alignment and bounds before touching the address space.
///
/// A block must be torn down exactly once, either by an explicit call to
/// [`dispose`](MemoryBlock::dispose) or by dropping it. Using a block after
/// disposing it, disposing it twice or disposing a backing block while other blocks
/// still hold views into it are fatal usage errors that panic rather than corrupt
/// shared memory state.
///
/// # Examples
///
/// ```rust
/// use vmview::{page_size, MemoryAllocationFlags, MemoryBlock};
///
/// let page = page_size();
/// let backing = MemoryBlock::new(page * 16, MemoryAllocationFlags::MIRRORABLE)?;
/// let viewer = MemoryBlock::new(
///     page * 16,
///     MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
/// )?;
///
/// // Alias the first backing page into the viewer's second page.
/// viewer.map_view(&backing, 0, page, page)?;
/// viewer.write(page, 0x1234_5678u32)?;
/// assert_eq!(backing.read::<u32>(0)?, 0x1234_5678);
///
/// viewer.unmap_view(&backing, page, page)?;
/// # Ok::<(), vmview::Error>(())
/// ```
pub struct MemoryBlock {
    base: NonNull<u8>,
    size: u64,
    flags: MemoryAllocationFlags,
    store: Option<Arc<BackingStore>>,
    views: Option<Mutex<ViewTable>>,
    disposed: bool,
}

// The base pointer targets a mapping owned by this block; structural state is behind
// the view-table mutex and the backing store is reference counted.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Allocates a new block of `size` bytes with the given capability flags.
    ///
    /// With empty flags the block is private, committed memory. With
    /// [`MemoryAllocationFlags::MIRRORABLE`] the block is additionally backed by a
    /// shareable memory object that other blocks may alias. With
    /// [`MemoryAllocationFlags::RESERVE`] only address space is claimed; adding
    /// [`MemoryAllocationFlags::VIEW_COMPATIBLE`] prepares the range so that
    /// page-aligned sub-ranges can later be retargeted with
    /// [`map_view`](MemoryBlock::map_view).
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the block in bytes; must be a multiple of [`page_size`](crate::page_size)
    /// * `flags` - Capability flags, fixed for the block's lifetime
    ///
    /// # Errors
    ///
    /// Returns [`Error::MisalignedArgument`] if `size` is not page aligned,
    /// [`Error::InvalidFlagsCombination`] if the flags conflict and
    /// [`Error::AllocationFailed`] if the OS cannot satisfy the request.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use vmview::{page_size, MemoryAllocationFlags, MemoryBlock};
    ///
    /// let block = MemoryBlock::new(page_size() * 4, MemoryAllocationFlags::empty())?;
    /// assert_eq!(block.size(), page_size() * 4);
    /// # Ok::<(), vmview::Error>(())
    /// ```
    pub fn new(size: u64, flags: MemoryAllocationFlags) -> Result<MemoryBlock> {
        check_aligned(size)?;

        if flags.contains(MemoryAllocationFlags::MIRRORABLE | MemoryAllocationFlags::VIEW_COMPATIBLE)
        {
            return Err(Error::InvalidFlagsCombination(
                "a block is either the source or the target of aliasing, never both",
            ));
        }
        if flags.contains(MemoryAllocationFlags::MIRRORABLE)
            && flags.contains(MemoryAllocationFlags::RESERVE)
        {
            return Err(Error::InvalidFlagsCombination(
                "a mirrorable block is committed at construction and cannot be reserved",
            ));
        }
        if flags.contains(MemoryAllocationFlags::VIEW_COMPATIBLE)
            && !flags.contains(MemoryAllocationFlags::RESERVE)
        {
            return Err(Error::InvalidFlagsCombination(
                "a view compatible block requires reserved address space",
            ));
        }

        let host = backend::host();

        if flags.contains(MemoryAllocationFlags::MIRRORABLE) {
            let store = Arc::new(BackingStore::new(size)?);
            let base = host.map_shareable(&store.memory, size)?;
            return Ok(MemoryBlock {
                base,
                size,
                flags,
                store: Some(store),
                views: None,
                disposed: false,
            });
        }

        if flags.contains(MemoryAllocationFlags::RESERVE) {
            let view_compatible = flags.contains(MemoryAllocationFlags::VIEW_COMPATIBLE);
            let base = host.reserve(size, view_compatible)?;
            return Ok(MemoryBlock {
                base,
                size,
                flags,
                store: None,
                views: view_compatible.then(|| Mutex::new(ViewTable::new())),
                disposed: false,
            });
        }

        let base = host.alloc(size)?;
        Ok(MemoryBlock {
            base,
            size,
            flags,
            store: None,
            views: None,
            disposed: false,
        })
    }

    /// Returns the size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the capability flags the block was allocated with.
    #[must_use]
    pub fn flags(&self) -> MemoryAllocationFlags {
        self.flags
    }

    /// Returns the stable base address of the block.
    ///
    /// The pointer stays valid and unchanged for the block's entire lifetime, across
    /// any number of map and unmap operations. This is the sanctioned boundary for
    /// handing raw memory access to external consumers; ownership of the block is
    /// not transferred with it. Accessing pages of a reserved block that were never
    /// committed or view mapped faults.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    #[must_use]
    pub fn pointer(&self) -> *mut u8 {
        self.assert_live();
        self.base.as_ptr()
    }

    /// Reads a value of type `T` from `base + offset`.
    ///
    /// The access goes straight through the base pointer, so it observes whatever is
    /// currently mapped at the range: private memory or an active view. `T` must be
    /// a fixed-size trivially-copyable type that is valid for any bit pattern; no
    /// alignment of `offset` is required.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `offset + size_of::<T>()` exceeds the block
    /// size.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use vmview::{page_size, MemoryAllocationFlags, MemoryBlock};
    ///
    /// let block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty())?;
    /// block.write(0x21, 0xBADC_0DEu32)?;
    /// assert_eq!(block.read::<u32>(0x21)?, 0xBADC_0DE);
    /// # Ok::<(), vmview::Error>(())
    /// ```
    pub fn read<T: Copy>(&self, offset: u64) -> Result<T> {
        self.assert_live();
        check_range(offset, std::mem::size_of::<T>() as u64, self.size)?;
        Ok(unsafe { self.base.as_ptr().add(offset as usize).cast::<T>().read_unaligned() })
    }

    /// Writes a value of type `T` to `base + offset`.
    ///
    /// Same access semantics and contracts as [`read`](MemoryBlock::read).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `offset + size_of::<T>()` exceeds the block
    /// size.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    pub fn write<T: Copy>(&self, offset: u64, value: T) -> Result<()> {
        self.assert_live();
        check_range(offset, std::mem::size_of::<T>() as u64, self.size)?;
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<T>()
                .write_unaligned(value);
        }
        Ok(())
    }

    /// Copies `buffer.len()` bytes starting at `offset` into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range exceeds the block size.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    pub fn read_slice(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.assert_live();
        check_range(offset, buffer.len() as u64, self.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset as usize),
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }
        Ok(())
    }

    /// Copies `data` into the block starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range exceeds the block size.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    pub fn write_slice(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.assert_live();
        check_range(offset, data.len() as u64, self.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Fills `length` bytes starting at `offset` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range exceeds the block size.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    pub fn fill(&self, offset: u64, length: u64, value: u8) -> Result<()> {
        self.assert_live();
        check_range(offset, length, self.size)?;
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .write_bytes(value, length as usize);
        }
        Ok(())
    }

    /// Commits `length` bytes at `offset` of a reserved block, making the pages
    /// readable, writable and zero-filled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFlagsCombination`] if the block was not allocated
    /// with [`MemoryAllocationFlags::RESERVE`], [`Error::MisalignedArgument`] /
    /// [`Error::OutOfRange`] on contract violations and [`Error::AllocationFailed`]
    /// if the OS refuses the commit.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    pub fn commit(&self, offset: u64, length: u64) -> Result<()> {
        self.assert_live();
        if !self.flags.contains(MemoryAllocationFlags::RESERVE) {
            return Err(Error::InvalidFlagsCombination(
                "commit requires a block allocated with reserved address space",
            ));
        }
        check_aligned(offset)?;
        check_aligned(length)?;
        check_range(offset, length, self.size)?;

        let _guard = self.views.as_ref().map(|views| lock!(views));
        backend::host().commit(self.base, offset, length)
    }

    /// Decommits `length` bytes at `offset`, returning the pages to the reserved
    /// state and releasing their physical backing.
    ///
    /// Decommitting a range that currently aliases a backing store tears the alias
    /// down without updating the view table; prefer
    /// [`unmap_view`](MemoryBlock::unmap_view) for aliased ranges.
    ///
    /// # Errors
    ///
    /// Same contract as [`commit`](MemoryBlock::commit).
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    pub fn decommit(&self, offset: u64, length: u64) -> Result<()> {
        self.assert_live();
        if !self.flags.contains(MemoryAllocationFlags::RESERVE) {
            return Err(Error::InvalidFlagsCombination(
                "decommit requires a block allocated with reserved address space",
            ));
        }
        check_aligned(offset)?;
        check_aligned(length)?;
        check_range(offset, length, self.size)?;

        let _guard = self.views.as_ref().map(|views| lock!(views));
        backend::host().decommit(self.base, offset, length)
    }

    /// Aliases `length` bytes of `backing`'s store, starting at `src_offset`, onto
    /// `[dst_offset, dst_offset + length)` of this block.
    ///
    /// Any page of the destination range that already held a view (of this or any
    /// other store) or private content is atomically replaced; afterwards writes
    /// through either block at corresponding offsets are mutually visible until the
    /// range is unmapped. Mapping with `length == 0` is a no-op.
    ///
    /// # Arguments
    ///
    /// * `backing` - The mirrorable block whose store is being aliased
    /// * `src_offset` - Page-aligned offset within `backing`
    /// * `dst_offset` - Page-aligned offset within this block
    /// * `length` - Page-aligned number of bytes to alias
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFlagsCombination`] if this block is not view
    /// compatible or `backing` is not mirrorable, [`Error::MisalignedArgument`] /
    /// [`Error::OutOfRange`] on contract violations, [`Error::AllocationFailed`] if
    /// the OS rejects the remap and [`Error::UnsupportedOnPlatform`] if the host
    /// lacks the remap primitive.
    ///
    /// # Panics
    ///
    /// Panics if either block has been disposed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use vmview::{page_size, MemoryAllocationFlags, MemoryBlock};
    ///
    /// let page = page_size();
    /// let backing = MemoryBlock::new(page * 4, MemoryAllocationFlags::MIRRORABLE)?;
    /// let viewer = MemoryBlock::new(
    ///     page * 4,
    ///     MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
    /// )?;
    ///
    /// viewer.map_view(&backing, page * 2, 0, page)?;
    /// backing.write(page * 2, 0xAAu8)?;
    /// assert_eq!(viewer.read::<u8>(0)?, 0xAA);
    /// # Ok::<(), vmview::Error>(())
    /// ```
    pub fn map_view(
        &self,
        backing: &MemoryBlock,
        src_offset: u64,
        dst_offset: u64,
        length: u64,
    ) -> Result<()> {
        self.assert_live();
        backing.assert_live();

        let views = self.views.as_ref().ok_or(Error::InvalidFlagsCombination(
            "the destination of a view mapping must be view compatible",
        ))?;
        let store = backing.store.as_ref().ok_or(Error::InvalidFlagsCombination(
            "the source of a view mapping must be mirrorable",
        ))?;

        check_aligned(src_offset)?;
        check_aligned(dst_offset)?;
        check_aligned(length)?;
        check_range(src_offset, length, backing.size)?;
        check_range(dst_offset, length, self.size)?;

        if length == 0 {
            return Ok(());
        }

        let mut table = lock!(views);
        backend::host().map_view(&store.memory, src_offset, self.base, dst_offset, length)?;
        table.insert(ViewMapping {
            offset: dst_offset,
            length,
            store: Arc::clone(store),
            store_offset: src_offset,
        });
        Ok(())
    }

    /// Reverts the portions of `[offset, offset + length)` currently aliased to
    /// `backing` to private, zero-filled memory that shares nothing with the store.
    ///
    /// The operation is idempotent with respect to mapping state: ranges that are
    /// already private, aliased to a different store or only partially aliased
    /// succeed without error, and only the portions actually aliased to `backing`
    /// are touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFlagsCombination`] if this block is not view
    /// compatible or `backing` is not mirrorable, [`Error::MisalignedArgument`] /
    /// [`Error::OutOfRange`] on contract violations and [`Error::AllocationFailed`]
    /// if the OS rejects the revert.
    ///
    /// # Panics
    ///
    /// Panics if either block has been disposed.
    pub fn unmap_view(&self, backing: &MemoryBlock, offset: u64, length: u64) -> Result<()> {
        self.assert_live();
        backing.assert_live();

        let views = self.views.as_ref().ok_or(Error::InvalidFlagsCombination(
            "the destination of a view unmapping must be view compatible",
        ))?;
        let store = backing.store.as_ref().ok_or(Error::InvalidFlagsCombination(
            "the source of a view unmapping must be mirrorable",
        ))?;

        check_aligned(offset)?;
        check_aligned(length)?;
        check_range(offset, length, self.size)?;

        if length == 0 {
            return Ok(());
        }

        let mut table = lock!(views);
        for (range_offset, range_length) in table.aliased_ranges(store, offset, length) {
            backend::host().unmap_view(self.base, range_offset, range_length)?;
        }
        table.remove(store, offset, length);
        Ok(())
    }

    /// Returns the backing-store offset that `offset` currently resolves to, or
    /// `None` if the offset is not covered by an active view.
    ///
    /// Intended for auditing and tests; accesses never consult this record, they
    /// observe the mapping state directly through the base pointer.
    ///
    /// # Panics
    ///
    /// Panics if the block has been disposed.
    #[must_use]
    pub fn view_source(&self, offset: u64) -> Option<u64> {
        self.assert_live();
        let views = self.views.as_ref()?;
        let table = lock!(views);
        table
            .backing_at(offset)
            .map(|(_, store_offset)| store_offset)
    }

    /// Releases the block: unmaps every view it holds, drops its backing store
    /// reference and releases the address-space reservation.
    ///
    /// Must be called at most once; dropping the block performs the same teardown
    /// for blocks that were not disposed explicitly.
    ///
    /// # Panics
    ///
    /// Panics if the block was already disposed, or if this is a mirrorable block
    /// whose store is still referenced by active views of other blocks.
    pub fn dispose(&mut self) {
        assert!(
            !self.disposed,
            "fatal usage error: MemoryBlock disposed twice"
        );
        self.release();
    }

    fn assert_live(&self) {
        assert!(
            !self.disposed,
            "fatal usage error: operation on a disposed MemoryBlock"
        );
    }

    fn release(&mut self) {
        self.disposed = true;

        if let Some(store) = self.store.take() {
            assert!(
                Arc::strong_count(&store) == 1,
                "fatal usage error: backing store destroyed while views still reference it"
            );
            let _ = backend::host().unmap_shareable(self.base, self.size);
            // Dropping the store destroys the OS object.
            return;
        }

        if let Some(views) = self.views.take() {
            // Dropping the recorded mappings releases their store references; the
            // reservation teardown below unmaps the views themselves.
            let mut table = views
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            drop(table.drain_all());
        }

        let _ = backend::host().release(self.base, self.size);
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if !self.disposed {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_size;

    #[test]
    fn conflicting_flags_are_rejected() {
        let page = page_size();

        let result = MemoryBlock::new(
            page,
            MemoryAllocationFlags::MIRRORABLE | MemoryAllocationFlags::VIEW_COMPATIBLE,
        );
        assert!(matches!(result, Err(Error::InvalidFlagsCombination(_))));

        let result = MemoryBlock::new(page, MemoryAllocationFlags::VIEW_COMPATIBLE);
        assert!(matches!(result, Err(Error::InvalidFlagsCombination(_))));

        let result = MemoryBlock::new(
            page,
            MemoryAllocationFlags::MIRRORABLE | MemoryAllocationFlags::RESERVE,
        );
        assert!(matches!(result, Err(Error::InvalidFlagsCombination(_))));
    }

    #[test]
    fn misaligned_size_is_rejected() {
        let result = MemoryBlock::new(0x1234, MemoryAllocationFlags::empty());
        assert!(matches!(result, Err(Error::MisalignedArgument { .. })));
    }

    #[test]
    fn typed_roundtrip_at_unaligned_offsets() {
        let block = MemoryBlock::new(page_size() * 2, MemoryAllocationFlags::empty()).unwrap();

        block.write(0x3, 0xDEAD_BEEF_CAFE_BABEu64).unwrap();
        assert_eq!(block.read::<u64>(0x3).unwrap(), 0xDEAD_BEEF_CAFE_BABE);

        block.write(0x1001, -1234i32).unwrap();
        assert_eq!(block.read::<i32>(0x1001).unwrap(), -1234);
    }

    #[test]
    fn accesses_beyond_bounds_are_rejected() {
        let block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty()).unwrap();
        let size = block.size();

        assert!(matches!(
            block.read::<u32>(size - 3),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            block.write(size, 0u8),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            block.read::<u8>(u64::MAX),
            Err(Error::OutOfRange { .. })
        ));

        // The last valid position works.
        block.write(size - 4, 0x11223344u32).unwrap();
        assert_eq!(block.read::<u32>(size - 4).unwrap(), 0x11223344);
    }

    #[test]
    fn slice_and_fill_accessors() {
        let block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty()).unwrap();

        block.write_slice(0x10, &[1, 2, 3, 4]).unwrap();
        let mut buffer = [0u8; 4];
        block.read_slice(0x10, &mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3, 4]);

        block.fill(0x10, 4, 0xFF).unwrap();
        block.read_slice(0x10, &mut buffer).unwrap();
        assert_eq!(buffer, [0xFF; 4]);

        let mut too_long = vec![0u8; block.size() as usize + 1];
        assert!(matches!(
            block.read_slice(0, &mut too_long),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn commit_and_decommit_on_reserved_block() {
        let page = page_size();
        let block = MemoryBlock::new(page * 4, MemoryAllocationFlags::RESERVE).unwrap();

        block.commit(page, page * 2).unwrap();
        block.write(page, 0x5555_AAAAu32).unwrap();
        assert_eq!(block.read::<u32>(page).unwrap(), 0x5555_AAAA);

        block.decommit(page, page * 2).unwrap();
        block.commit(page, page).unwrap();
        // Freshly committed pages read as zero.
        assert_eq!(block.read::<u32>(page).unwrap(), 0);
    }

    #[test]
    fn commit_requires_a_reserved_block() {
        let block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty()).unwrap();
        assert!(matches!(
            block.commit(0, page_size()),
            Err(Error::InvalidFlagsCombination(_))
        ));
        assert!(matches!(
            block.decommit(0, page_size()),
            Err(Error::InvalidFlagsCombination(_))
        ));
    }

    #[test]
    fn map_view_requires_the_right_capabilities() {
        let page = page_size();
        let plain = MemoryBlock::new(page, MemoryAllocationFlags::empty()).unwrap();
        let backing = MemoryBlock::new(page, MemoryAllocationFlags::MIRRORABLE).unwrap();
        let viewer = MemoryBlock::new(
            page,
            MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
        )
        .unwrap();

        // Plain block as destination.
        assert!(matches!(
            plain.map_view(&backing, 0, 0, page),
            Err(Error::InvalidFlagsCombination(_))
        ));
        // Plain block as source.
        assert!(matches!(
            viewer.map_view(&plain, 0, 0, page),
            Err(Error::InvalidFlagsCombination(_))
        ));
    }

    #[test]
    fn map_view_validates_alignment_and_bounds() {
        let page = page_size();
        let backing = MemoryBlock::new(page * 2, MemoryAllocationFlags::MIRRORABLE).unwrap();
        let viewer = MemoryBlock::new(
            page * 2,
            MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
        )
        .unwrap();

        assert!(matches!(
            viewer.map_view(&backing, 1, 0, page),
            Err(Error::MisalignedArgument { .. })
        ));
        assert!(matches!(
            viewer.map_view(&backing, 0, page / 2, page),
            Err(Error::MisalignedArgument { .. })
        ));
        assert!(matches!(
            viewer.map_view(&backing, 0, 0, page * 4),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            viewer.map_view(&backing, page * 2, 0, page),
            Err(Error::OutOfRange { .. })
        ));

        // A zero-length mapping is a no-op.
        viewer.map_view(&backing, 0, 0, 0).unwrap();
    }

    #[test]
    fn view_source_tracks_the_mapping_record() {
        let page = page_size();
        let backing = MemoryBlock::new(page * 4, MemoryAllocationFlags::MIRRORABLE).unwrap();
        let viewer = MemoryBlock::new(
            page * 4,
            MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
        )
        .unwrap();

        assert_eq!(viewer.view_source(0), None);

        viewer.map_view(&backing, page * 2, 0, page * 2).unwrap();
        assert_eq!(viewer.view_source(0), Some(page * 2));
        assert_eq!(viewer.view_source(page), Some(page * 3));
        assert_eq!(viewer.view_source(page * 2), None);

        viewer.unmap_view(&backing, 0, page).unwrap();
        assert_eq!(viewer.view_source(0), None);
        assert_eq!(viewer.view_source(page), Some(page * 3));
    }

    #[test]
    fn unmap_view_is_idempotent() {
        let page = page_size();
        let backing = MemoryBlock::new(page * 4, MemoryAllocationFlags::MIRRORABLE).unwrap();
        let viewer = MemoryBlock::new(
            page * 4,
            MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
        )
        .unwrap();

        // Unmapping a range that was never mapped succeeds.
        viewer.unmap_view(&backing, 0, page * 4).unwrap();

        viewer.map_view(&backing, 0, page, page).unwrap();
        viewer.unmap_view(&backing, page, page).unwrap();
        viewer.unmap_view(&backing, page, page).unwrap();
        viewer.unmap_view(&backing, 0, page * 4).unwrap();
    }

    #[test]
    #[should_panic(expected = "disposed twice")]
    fn double_dispose_is_fatal() {
        let mut block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty()).unwrap();
        block.dispose();
        block.dispose();
    }

    #[test]
    #[should_panic(expected = "operation on a disposed MemoryBlock")]
    fn use_after_dispose_is_fatal() {
        let mut block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty()).unwrap();
        block.dispose();
        let _ = block.read::<u32>(0);
    }

    #[test]
    #[should_panic(expected = "views still reference it")]
    fn disposing_a_backing_store_with_live_views_is_fatal() {
        let page = page_size();
        let mut backing = MemoryBlock::new(page, MemoryAllocationFlags::MIRRORABLE).unwrap();
        let viewer = MemoryBlock::new(
            page,
            MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
        )
        .unwrap();

        viewer.map_view(&backing, 0, 0, page).unwrap();
        backing.dispose();
    }
}
