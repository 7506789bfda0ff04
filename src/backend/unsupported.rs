//! Fallback backend for hosts with neither POSIX nor Win32 virtual memory APIs.
//!
//! Every operation reports [`Error::UnsupportedOnPlatform`]; nothing is silently
//! degraded to copying or simulation.

use std::ptr::NonNull;

use super::Backend;
use crate::{Error, Result};

/// Placeholder shareable-memory type for unsupported hosts; never constructed.
#[derive(Debug)]
pub(crate) struct ShareableMemory {}

/// Backend implementation for unsupported hosts.
pub(crate) struct Unsupported;

impl Backend for Unsupported {
    fn page_size(&self) -> u64 {
        0x1000
    }

    fn alloc(&self, _size: u64) -> Result<NonNull<u8>> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn reserve(&self, _size: u64, _view_compatible: bool) -> Result<NonNull<u8>> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn commit(&self, _base: NonNull<u8>, _offset: u64, _length: u64) -> Result<()> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn decommit(&self, _base: NonNull<u8>, _offset: u64, _length: u64) -> Result<()> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn create_shareable(&self, _size: u64) -> Result<ShareableMemory> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn map_shareable(&self, _shareable: &ShareableMemory, _size: u64) -> Result<NonNull<u8>> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn map_view(
        &self,
        _shareable: &ShareableMemory,
        _src_offset: u64,
        _base: NonNull<u8>,
        _offset: u64,
        _length: u64,
    ) -> Result<()> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn unmap_view(&self, _base: NonNull<u8>, _offset: u64, _length: u64) -> Result<()> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn unmap_shareable(&self, _base: NonNull<u8>, _size: u64) -> Result<()> {
        Err(Error::UnsupportedOnPlatform)
    }

    fn release(&self, _base: NonNull<u8>, _size: u64) -> Result<()> {
        Err(Error::UnsupportedOnPlatform)
    }
}
