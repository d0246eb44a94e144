//! Boot-time hardware discovery, run once before the frame allocator and address spaces exist.

pub mod atags;

pub use atags::MemoryRange;
