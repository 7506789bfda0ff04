//! Win32 backend built on placeholder reservations.
//!
//! View-compatible address space is reserved as a *placeholder*
//! (`VirtualAlloc2` + `MEM_RESERVE_PLACEHOLDER`). Placeholders can be split and
//! coalesced with `VirtualFree`, replaced by a section view with `MapViewOfFile3`
//! (`MEM_REPLACE_PLACEHOLDER`) or by committed private pages with `VirtualAlloc2`,
//! and recovered with `UnmapViewOfFile2` (`MEM_PRESERVE_PLACEHOLDER`).
//!
//! The kernel gives no way to partially unmap a section view, so the backend keeps a
//! per-reservation ledger of how the range is currently carved up (placeholders,
//! committed replacements, mapped views and the section offset each view came from).
//! When an operation hits the middle of an existing view, the whole view is unmapped
//! and its surviving edges are re-mapped from the recorded section offsets; committed
//! edges are preserved by copying their bytes across the replacement. One section
//! object exists per backing store, so remap churn never accumulates kernel handles.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;
use std::sync::Mutex;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile3, UnmapViewOfFile2, VirtualAlloc, VirtualAlloc2, VirtualFree,
    MEMORY_MAPPED_VIEW_ADDRESS, MEM_COALESCE_PLACEHOLDERS, MEM_COMMIT, MEM_DECOMMIT,
    MEM_PRESERVE_PLACEHOLDER, MEM_RELEASE, MEM_REPLACE_PLACEHOLDER, MEM_RESERVE,
    MEM_RESERVE_PLACEHOLDER, PAGE_NOACCESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use super::Backend;
use crate::{Error, Result};

/// A shareable memory object usable as the source of view mappings.
///
/// Wraps the pagefile-backed section handle; the handle is closed when the last block
/// referencing the store drops it.
#[derive(Debug)]
pub(crate) struct ShareableMemory {
    handle: HANDLE,
}

// The section handle is process-global state, not thread-affine.
unsafe impl Send for ShareableMemory {}
unsafe impl Sync for ShareableMemory {}

impl Drop for ShareableMemory {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

/// How one carved-out piece of a view-compatible reservation is currently backed.
#[derive(Clone)]
enum SegmentKind {
    /// A reserved placeholder, inaccessible.
    Placeholder,
    /// Committed private pages that replaced a placeholder.
    Committed,
    /// A mapped section view, with the state needed to re-map surviving edges.
    View { section: HANDLE, section_offset: u64 },
}

struct SegmentEntry {
    length: u64,
    kind: SegmentKind,
}

impl SegmentEntry {
    fn placeholder(length: u64) -> Self {
        SegmentEntry {
            length,
            kind: SegmentKind::Placeholder,
        }
    }

    fn committed(length: u64) -> Self {
        SegmentEntry {
            length,
            kind: SegmentKind::Committed,
        }
    }

    fn view(length: u64, section: HANDLE, section_offset: u64) -> Self {
        SegmentEntry {
            length,
            kind: SegmentKind::View {
                section,
                section_offset,
            },
        }
    }
}

/// Segments of one view-compatible reservation, keyed by offset.
///
/// Invariant: the segments partition `[0, size)` and every entry corresponds to
/// exactly one OS-level allocation, placeholder or view.
struct Reservation {
    segments: BTreeMap<u64, SegmentEntry>,
}

/// Backend implementation for Windows hosts.
pub(crate) struct Win32 {
    reservations: Mutex<BTreeMap<usize, Reservation>>,
}

// Raw section handles inside the ledger are process-global.
unsafe impl Send for Win32 {}
unsafe impl Sync for Win32 {}

fn os_error() -> Error {
    Error::AllocationFailed(io::Error::last_os_error())
}

fn process() -> HANDLE {
    unsafe { GetCurrentProcess() }
}

fn address_at(base: NonNull<u8>, offset: u64) -> *mut c_void {
    unsafe { base.as_ptr().add(offset as usize).cast() }
}

/// Splits the placeholder or placeholder-replacing allocation at `base + offset` so
/// that `length` bytes become their own placeholder.
fn split_placeholder(base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
    let ok = unsafe {
        VirtualFree(
            address_at(base, offset),
            length as usize,
            MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER,
        )
    };
    if ok == 0 {
        return Err(os_error());
    }
    Ok(())
}

/// Merges the contiguous placeholders covering `[offset, offset + length)` into one.
fn coalesce_placeholders(base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
    let ok = unsafe {
        VirtualFree(
            address_at(base, offset),
            length as usize,
            MEM_RELEASE | MEM_COALESCE_PLACEHOLDERS,
        )
    };
    if ok == 0 {
        return Err(os_error());
    }
    Ok(())
}

/// Unmaps the section view based at `base + offset`, leaving a placeholder behind.
fn unmap_to_placeholder(base: NonNull<u8>, offset: u64) -> Result<()> {
    let address = MEMORY_MAPPED_VIEW_ADDRESS {
        Value: address_at(base, offset),
    };
    let ok = unsafe { UnmapViewOfFile2(process(), address, MEM_PRESERVE_PLACEHOLDER) };
    if ok == 0 {
        return Err(os_error());
    }
    Ok(())
}

/// Replaces the exact placeholder at `base + offset` with a section view.
fn map_over_placeholder(
    section: HANDLE,
    section_offset: u64,
    base: NonNull<u8>,
    offset: u64,
    length: u64,
) -> Result<()> {
    let view = unsafe {
        MapViewOfFile3(
            section,
            process(),
            address_at(base, offset),
            section_offset,
            length as usize,
            MEM_REPLACE_PLACEHOLDER,
            PAGE_READWRITE,
            std::ptr::null_mut(),
            0,
        )
    };
    if view.Value.is_null() {
        return Err(os_error());
    }
    Ok(())
}

/// Replaces the exact placeholder at `base + offset` with committed private pages.
fn commit_over_placeholder(base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
    let ptr = unsafe {
        VirtualAlloc2(
            process(),
            address_at(base, offset),
            length as usize,
            MEM_RESERVE | MEM_COMMIT | MEM_REPLACE_PLACEHOLDER,
            PAGE_READWRITE,
            std::ptr::null_mut(),
            0,
        )
    };
    if ptr.is_null() {
        return Err(os_error());
    }
    Ok(())
}

fn copy_out(base: NonNull<u8>, offset: u64, length: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; length as usize];
    unsafe {
        std::ptr::copy_nonoverlapping(
            base.as_ptr().add(offset as usize),
            bytes.as_mut_ptr(),
            length as usize,
        );
    }
    bytes
}

fn copy_back(base: NonNull<u8>, offset: u64, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            base.as_ptr().add(offset as usize),
            bytes.len(),
        );
    }
}

/// Restores `[offset, offset + length)` of a tracked reservation to a single exact
/// placeholder, preserving every byte outside the range.
///
/// Views overlapping the range are unmapped whole and their surviving edges re-mapped
/// from the recorded section offsets; committed segments have their surviving bytes
/// copied across the replacement.
fn carve_placeholder(
    res: &mut Reservation,
    base: NonNull<u8>,
    offset: u64,
    length: u64,
) -> Result<()> {
    let end = offset + length;

    let overlapping: Vec<(u64, u64, SegmentKind)> = res
        .segments
        .range(..end)
        .filter(|&(&seg_off, entry)| seg_off + entry.length > offset)
        .map(|(&seg_off, entry)| (seg_off, entry.length, entry.kind.clone()))
        .collect();

    for (seg_off, seg_len, kind) in overlapping {
        let seg_end = seg_off + seg_len;
        match kind {
            SegmentKind::Placeholder => {}
            SegmentKind::View {
                section,
                section_offset,
            } => {
                unmap_to_placeholder(base, seg_off)?;
                res.segments.remove(&seg_off);

                let mut hole_start = seg_off;
                let mut hole_len = seg_len;
                if seg_off < offset {
                    let left = offset - seg_off;
                    split_placeholder(base, seg_off, left)?;
                    map_over_placeholder(section, section_offset, base, seg_off, left)?;
                    res.segments
                        .insert(seg_off, SegmentEntry::view(left, section, section_offset));
                    hole_start = offset;
                    hole_len -= left;
                }
                if seg_end > end {
                    let right = seg_end - end;
                    split_placeholder(base, end, right)?;
                    let right_offset = section_offset + (end - seg_off);
                    map_over_placeholder(section, right_offset, base, end, right)?;
                    res.segments
                        .insert(end, SegmentEntry::view(right, section, right_offset));
                    hole_len -= right;
                }
                res.segments
                    .insert(hole_start, SegmentEntry::placeholder(hole_len));
            }
            SegmentKind::Committed => {
                let left = (seg_off < offset).then(|| copy_out(base, seg_off, offset - seg_off));
                let right = (seg_end > end).then(|| copy_out(base, end, seg_end - end));

                split_placeholder(base, seg_off, seg_len)?;
                res.segments.remove(&seg_off);

                let mut hole_start = seg_off;
                let mut hole_len = seg_len;
                if let Some(bytes) = left {
                    let len = bytes.len() as u64;
                    split_placeholder(base, seg_off, len)?;
                    commit_over_placeholder(base, seg_off, len)?;
                    copy_back(base, seg_off, &bytes);
                    res.segments.insert(seg_off, SegmentEntry::committed(len));
                    hole_start = offset;
                    hole_len -= len;
                }
                if let Some(bytes) = right {
                    let len = bytes.len() as u64;
                    split_placeholder(base, end, len)?;
                    commit_over_placeholder(base, end, len)?;
                    copy_back(base, end, &bytes);
                    res.segments.insert(end, SegmentEntry::committed(len));
                    hole_len -= len;
                }
                res.segments
                    .insert(hole_start, SegmentEntry::placeholder(hole_len));
            }
        }
    }

    // Everything intersecting the range is a placeholder now. The first and last
    // fragments may extend beyond the range; fold the fragments into one placeholder
    // and carve the exact range out of it.
    let fragments: Vec<(u64, u64)> = res
        .segments
        .range(..end)
        .filter(|&(&seg_off, entry)| seg_off + entry.length > offset)
        .map(|(&seg_off, entry)| {
            debug_assert!(matches!(entry.kind, SegmentKind::Placeholder));
            (seg_off, entry.length)
        })
        .collect();

    let run_start = fragments.first().map_or(offset, |&(seg_off, _)| seg_off);
    let run_end = fragments
        .last()
        .map_or(end, |&(seg_off, seg_len)| seg_off + seg_len);

    if fragments.len() > 1 {
        coalesce_placeholders(base, run_start, run_end - run_start)?;
    }
    for (seg_off, _) in fragments {
        res.segments.remove(&seg_off);
    }

    if run_start < offset || run_end > end {
        // One split carves the exact range; the OS keeps the outer pieces as
        // placeholders of their own.
        split_placeholder(base, offset, length)?;
    }
    if run_start < offset {
        res.segments
            .insert(run_start, SegmentEntry::placeholder(offset - run_start));
    }
    if run_end > end {
        res.segments
            .insert(end, SegmentEntry::placeholder(run_end - end));
    }
    res.segments.insert(offset, SegmentEntry::placeholder(length));

    Ok(())
}

impl Win32 {
    pub(crate) const fn new() -> Self {
        Win32 {
            reservations: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Backend for Win32 {
    fn page_size(&self) -> u64 {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        u64::from(info.dwPageSize)
    }

    fn alloc(&self, size: u64) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                size as usize,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        NonNull::new(ptr.cast()).ok_or_else(os_error)
    }

    fn reserve(&self, size: u64, view_compatible: bool) -> Result<NonNull<u8>> {
        if !view_compatible {
            let ptr = unsafe {
                VirtualAlloc(std::ptr::null(), size as usize, MEM_RESERVE, PAGE_NOACCESS)
            };
            return NonNull::new(ptr.cast()).ok_or_else(os_error);
        }

        let ptr = unsafe {
            VirtualAlloc2(
                process(),
                std::ptr::null(),
                size as usize,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS,
                std::ptr::null_mut(),
                0,
            )
        };
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(os_error)?;

        let mut segments = BTreeMap::new();
        segments.insert(0, SegmentEntry::placeholder(size));
        lock!(self.reservations).insert(base.as_ptr() as usize, Reservation { segments });

        Ok(base)
    }

    fn commit(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
        let mut reservations = lock!(self.reservations);
        if let Some(res) = reservations.get_mut(&(base.as_ptr() as usize)) {
            carve_placeholder(res, base, offset, length)?;
            commit_over_placeholder(base, offset, length)?;
            res.segments.insert(offset, SegmentEntry::committed(length));
            return Ok(());
        }

        let ptr = unsafe {
            VirtualAlloc(
                address_at(base, offset),
                length as usize,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(os_error());
        }
        Ok(())
    }

    fn decommit(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
        let mut reservations = lock!(self.reservations);
        if let Some(res) = reservations.get_mut(&(base.as_ptr() as usize)) {
            // Carving back to a placeholder both drops the physical pages and returns
            // the range to the reserved state.
            return carve_placeholder(res, base, offset, length);
        }

        let ok = unsafe { VirtualFree(address_at(base, offset), length as usize, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(os_error());
        }
        Ok(())
    }

    fn create_shareable(&self, size: u64) -> Result<ShareableMemory> {
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                std::ptr::null(),
            )
        };
        if handle.is_null() {
            return Err(os_error());
        }
        Ok(ShareableMemory { handle })
    }

    fn map_shareable(&self, shareable: &ShareableMemory, size: u64) -> Result<NonNull<u8>> {
        let view = unsafe {
            MapViewOfFile3(
                shareable.handle,
                process(),
                std::ptr::null(),
                0,
                size as usize,
                0,
                PAGE_READWRITE,
                std::ptr::null_mut(),
                0,
            )
        };
        NonNull::new(view.Value.cast()).ok_or_else(os_error)
    }

    fn map_view(
        &self,
        shareable: &ShareableMemory,
        src_offset: u64,
        base: NonNull<u8>,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let mut reservations = lock!(self.reservations);
        let res = reservations
            .get_mut(&(base.as_ptr() as usize))
            .expect("view mapping targets an untracked reservation");

        carve_placeholder(res, base, offset, length)?;
        map_over_placeholder(shareable.handle, src_offset, base, offset, length)?;
        res.segments
            .insert(offset, SegmentEntry::view(length, shareable.handle, src_offset));
        Ok(())
    }

    fn unmap_view(&self, base: NonNull<u8>, offset: u64, length: u64) -> Result<()> {
        let mut reservations = lock!(self.reservations);
        let res = reservations
            .get_mut(&(base.as_ptr() as usize))
            .expect("view unmapping targets an untracked reservation");

        carve_placeholder(res, base, offset, length)?;
        commit_over_placeholder(base, offset, length)?;
        res.segments.insert(offset, SegmentEntry::committed(length));
        Ok(())
    }

    fn unmap_shareable(&self, base: NonNull<u8>, _size: u64) -> Result<()> {
        let address = MEMORY_MAPPED_VIEW_ADDRESS {
            Value: base.as_ptr().cast(),
        };
        let ok = unsafe { UnmapViewOfFile2(process(), address, 0) };
        if ok == 0 {
            return Err(os_error());
        }
        Ok(())
    }

    fn release(&self, base: NonNull<u8>, _size: u64) -> Result<()> {
        let removed = lock!(self.reservations).remove(&(base.as_ptr() as usize));

        let Some(res) = removed else {
            let ok = unsafe { VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) };
            if ok == 0 {
                return Err(os_error());
            }
            return Ok(());
        };

        // Every segment is its own OS allocation, placeholder or view; tear each down.
        for (&seg_off, entry) in &res.segments {
            let ok = match entry.kind {
                SegmentKind::View { .. } => {
                    let address = MEMORY_MAPPED_VIEW_ADDRESS {
                        Value: address_at(base, seg_off),
                    };
                    unsafe { UnmapViewOfFile2(process(), address, 0) }
                }
                SegmentKind::Placeholder | SegmentKind::Committed => unsafe {
                    VirtualFree(address_at(base, seg_off), 0, MEM_RELEASE)
                },
            };
            if ok == 0 {
                return Err(os_error());
            }
        }
        Ok(())
    }
}
