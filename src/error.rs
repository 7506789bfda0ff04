use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all possible error conditions that can occur while allocating memory
/// blocks, committing pages and mapping or unmapping views. Each variant provides specific
/// context about the failure mode to enable appropriate error handling.
///
/// # Error Categories
///
/// ## Allocation Errors
/// - [`Error::AllocationFailed`] - The operating system refused a reservation or commit
/// - [`Error::InvalidFlagsCombination`] - Conflicting or incomplete capability flags
///
/// ## Contract Violations
/// - [`Error::OutOfRange`] - Offset/length exceeds a block's bounds
/// - [`Error::MisalignedArgument`] - Offset/length not a multiple of the page size
///
/// ## Platform Errors
/// - [`Error::UnsupportedOnPlatform`] - The host lacks the required remap primitive
///
/// Violated lifetime invariants (double dispose, operating on a disposed block, destroying
/// a backing store while views still reference it) are not represented here: they are
/// programming errors that cannot be recovered from and fail fast with a panic instead.
///
/// # Examples
///
/// ```rust
/// use vmview::{Error, MemoryAllocationFlags, MemoryBlock};
///
/// match MemoryBlock::new(0x1234, MemoryAllocationFlags::empty()) {
///     Ok(block) => println!("Allocated {} bytes", block.size()),
///     Err(Error::MisalignedArgument { value, page_size }) => {
///         eprintln!("0x{value:x} is not a multiple of the 0x{page_size:x} page size");
///     }
///     Err(e) => eprintln!("Allocation error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The operating system could not satisfy a reservation, commit or mapping request.
    ///
    /// This usually indicates address space or physical memory exhaustion, or an
    /// OS-imposed limit on the number of distinct mappings a process may hold.
    /// The wrapped [`std::io::Error`] carries the underlying OS error code.
    #[error("The operating system rejected the memory operation: {0}")]
    AllocationFailed(#[source] std::io::Error),

    /// Conflicting or incomplete capability flags were supplied.
    ///
    /// Raised at construction time when the requested [`MemoryAllocationFlags`] do not
    /// form a valid capability set (for example `MIRRORABLE` together with
    /// `VIEW_COMPATIBLE`), and at mapping time when a block lacks the capability the
    /// operation requires.
    ///
    /// [`MemoryAllocationFlags`]: crate::MemoryAllocationFlags
    #[error("Invalid combination of allocation flags: {0}")]
    InvalidFlagsCombination(&'static str),

    /// An offset/length pair exceeds the bounds of the block it was applied to.
    ///
    /// All accessors and mapping operations validate their ranges against the block
    /// size before touching memory; this error reports the rejected range.
    #[error("Range 0x{offset:x}+0x{length:x} exceeds the block size of 0x{size:x}")]
    OutOfRange {
        /// The offset that was requested
        offset: u64,
        /// The length that was requested
        length: u64,
        /// The size of the block the range was checked against
        size: u64,
    },

    /// An offset or length is not a multiple of the host page size.
    ///
    /// Mapping operations work at page granularity; every offset and length they
    /// receive must be page aligned.
    #[error("Value 0x{value:x} is not a multiple of the page size 0x{page_size:x}")]
    MisalignedArgument {
        /// The misaligned value
        value: u64,
        /// The host page size the value was checked against
        page_size: u64,
    },

    /// The host platform lacks the virtual memory primitives required for the operation.
    ///
    /// View mapping needs an OS facility to retarget a page range in place. On hosts
    /// without one this error is reported rather than silently degrading to copying.
    #[error("The host platform does not support page aliasing")]
    UnsupportedOnPlatform,
}
