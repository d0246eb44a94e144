//! Typed recoverable errors for `AddressSpace` operations.
//!
//! Each is a pure data value with no dynamic payload; unrecoverable conditions go through
//! `panic::panic` instead (see `crate::panic::PanicCode`).
//!
//! `InconsistentSupersection` is deliberately absent: it named only dead paths in the
//! reference implementation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// A `reserve` targeted a range that is not entirely Free.
    SomeBlocksNotFree,
    /// An `allocate`/`map`/`release` targeted a range that is not entirely Reserved.
    SomeBlocksNotReserved,
    /// A `deallocate` targeted a range that is not entirely Committed.
    SomeBlocksNotCommitted,
    /// An address or range falls outside `[start_entry, start_entry + num_entries)`.
    OutOfBounds,
    /// `virtual_to_physical`/`physical_to_virtual` found no mapping.
    AddressNotMapped,
    /// No free region of the requested size exists anywhere in the space.
    MemorySpaceExhausted,
    /// `get_block_state` was asked for `Page` granularity at an address whose first-level
    /// entry is not a second-level table.
    NotMappedAsPage,
    /// `get_block_state` was asked for `Section`/`Supersection` granularity at an address
    /// whose first-level entry is a second-level table, not a section.
    NotMappedAsSection,
    /// The frame allocator could not satisfy a request mid-operation; blocks committed
    /// earlier in the same call have already been rolled back.
    OutOfMemory,
}
