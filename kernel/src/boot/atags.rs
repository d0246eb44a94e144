//! ATAG chain parser.
//!
//! The boot loader hands the kernel a pointer to a list of tags describing the hardware it
//! found, terminated by `ATAG_NONE`. Only `ATAG_MEM` feeds the memory layout; the rest are
//! parsed just far enough to dump on the boot console under `verbose`.

use crate::panic::{panic, PanicCode};
use crate::println;

const ATAG_NONE: u32 = 0x0000_0000;
const ATAG_CORE: u32 = 0x5441_0001;
const ATAG_MEM: u32 = 0x5441_0002;

#[repr(C)]
struct AtagHeader {
    /// Length of the tag in 32-bit words, including this header.
    size_words: u32,
    tag: u32,
}

#[repr(C)]
struct AtagCore {
    flags: u32,
    pagesize: u32,
    rootdev: u32,
}

#[repr(C)]
struct AtagMem {
    size: u32,
    start: u32,
}

/// The `(start, size)` of the first `ATAG_MEM` tag found in the chain, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u32,
    pub size: u32,
}

/// Walks the ATAG chain at `base`, logging every tag it recognises, and returns the first
/// `ATAG_MEM` tag found.
///
/// Panics with `NonZeroBase` if that tag's `start` is not `0`: the rest of this crate assumes
/// physical memory begins at address zero.
///
/// # Safety
/// `base` must point at a valid, `ATAG_NONE`-terminated ATAG chain.
pub unsafe fn parse(base: *const u32) -> MemoryRange {
    let mut cursor = base;
    let mut memory = None;

    loop {
        // SAFETY: caller guarantees a valid, terminated chain; each tag's `size_words` (read
        // before advancing) bounds how far we step forward.
        let header = unsafe { &*cursor.cast::<AtagHeader>() };
        match header.tag {
            ATAG_NONE => break,
            ATAG_CORE => {
                // SAFETY: `size_words` for ATAG_CORE covers this payload.
                let core = unsafe { &*cursor.add(2).cast::<AtagCore>() };
                println!(
                    "atag core: flags={:#x} pagesize={:#x} rootdev={:#x}",
                    core.flags, core.pagesize, core.rootdev
                );
            }
            ATAG_MEM => {
                // SAFETY: `size_words` for ATAG_MEM covers this payload.
                let mem = unsafe { &*cursor.add(2).cast::<AtagMem>() };
                println!("atag mem: start={:#x} size={:#x}", mem.start, mem.size);
                if memory.is_none() {
                    memory = Some(MemoryRange { start: mem.start, size: mem.size });
                }
            }
            other => println!("atag other: {:#010x}", other),
        }
        // SAFETY: advancing by the tag's own declared word count stays within the chain.
        cursor = unsafe { cursor.add(header.size_words as usize) };
    }

    let memory = memory.unwrap_or_else(|| panic(PanicCode::InvalidParameter));
    if memory.start != 0 {
        panic(PanicCode::NonZeroBase);
    }
    memory
}
