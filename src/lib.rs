// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # vmview
//!
//! A cross-platform virtual memory abstraction with shareable backing stores and
//! page-granular view mapping. `vmview` lets a process reserve ranges of address
//! space, optionally back them with shareable physical memory, and dynamically remap
//! page-aligned sub-ranges of one block to alias pages owned by another — the
//! copy-free address-space machinery an emulator or similar host application needs
//! for multiple virtual views of the same physical pages.
//!
//! ## Features
//!
//! - **Reservations and commits** - Claim address space without physical backing and
//!   commit pages on demand
//! - **Shareable backing stores** - Mirrorable blocks expose their pages for aliasing
//!   by any number of viewing blocks, with reference-counted lifetime
//! - **View mapping** - Punch-in/punch-out remapping of page ranges with correct
//!   overlap splitting, observable immediately through stable base pointers
//! - **No kernel-object churn** - Remapping reuses one mapping object per backing
//!   store, so hundreds of thousands of map/unmap cycles stay inside OS per-process
//!   mapping limits
//! - **Cross-platform** - POSIX (`mmap`/`memfd`/`shm`) and Windows
//!   (`VirtualAlloc2` placeholders) backends behind one interface
//!
//! ## Quick Start
//!
//! ```rust
//! use vmview::{page_size, MemoryAllocationFlags, MemoryBlock};
//!
//! let page = page_size();
//!
//! // A backing block whose pages other blocks may alias.
//! let backing = MemoryBlock::new(page * 16, MemoryAllocationFlags::MIRRORABLE)?;
//!
//! // A viewing block: reserved address space prepared for remapping.
//! let viewer = MemoryBlock::new(
//!     page * 16,
//!     MemoryAllocationFlags::RESERVE | MemoryAllocationFlags::VIEW_COMPATIBLE,
//! )?;
//!
//! // Alias four backing pages into the viewer, then write through the alias.
//! viewer.map_view(&backing, page, 0, page * 4)?;
//! viewer.write(0, 0xBADC_0DEu32)?;
//! assert_eq!(backing.read::<u32>(page)?, 0xBADC_0DE);
//!
//! // Revert part of the alias; the rest keeps working.
//! viewer.unmap_view(&backing, page * 3, page)?;
//! # Ok::<(), vmview::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `vmview` is organized into two layers:
//!
//! - [`MemoryBlock`] - The public entity: owns an address-space reservation,
//!   optionally a shareable backing store, and the ordered record of its active view
//!   mappings. Typed and bulk accessors go straight through the stable base pointer,
//!   never through the mapping record, so they automatically observe whatever is
//!   currently mapped.
//! - The platform backend - One implementation per host OS family behind a single
//!   trait, selected once at startup. It performs the actual reservation, commit,
//!   shareable-object creation and in-place page retargeting.
//!
//! ## Lifetime contract
//!
//! A block is torn down exactly once, by [`MemoryBlock::dispose`] or by dropping it.
//! A backing block must outlive every view mapped into it; violating that, disposing
//! twice, or using a disposed block is a fatal usage error that panics rather than
//! risk corrupting shared memory state. Recoverable misuse (bad flags, misaligned or
//! out-of-bounds ranges) is reported through [`Error`] instead.
//!
//! ## Concurrency
//!
//! Structural operations on one block serialize on an internal lock. Plain reads and
//! writes are not serialized against remaps: a racing access observes the old or the
//! new backing, exactly as hardware would during a live remap, but never corrupts
//! the mapping record.

#[macro_use]
pub(crate) mod macros;

pub(crate) mod backend;
pub(crate) mod block;
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use vmview::prelude::*;
///
/// let block = MemoryBlock::new(page_size(), MemoryAllocationFlags::empty())?;
/// assert_eq!(block.read::<u32>(0)?, 0);
/// # Ok::<(), vmview::Error>(())
/// ```
pub mod prelude;

/// `vmview` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]. Used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `vmview` Error type
///
/// The main error type for all operations in this crate. See [`error::Error`] for
/// the taxonomy of allocation failures, contract violations and platform limits.
pub use error::Error;

/// Memory blocks and their capability flags.
///
/// [`MemoryBlock`] is the main entry point: allocate with [`MemoryBlock::new`],
/// access through [`MemoryBlock::read`] / [`MemoryBlock::write`] /
/// [`MemoryBlock::pointer`], and alias page ranges between blocks with
/// [`MemoryBlock::map_view`] / [`MemoryBlock::unmap_view`].
pub use block::{MemoryAllocationFlags, MemoryBlock};

/// Host page size query; every mapping offset and length must be a multiple of it.
pub use backend::page_size;
