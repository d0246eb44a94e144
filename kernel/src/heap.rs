//! Kernel heap: a fixed-block `GlobalAlloc`.
//!
//! Grounded on the teacher's `src/kernel/heap.rs`: three power-of-two free-list pools
//! (32/128/512 byte blocks) carved out of one contiguous range, with anything bigger falling
//! through to a null allocation. That version initializes over a static, linker-reserved range;
//! this one sources its range from [`AddressSpace::reserve_allocate_at`] instead, since no range
//! is available to hand out until the frame allocator exists.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp::{max, min};
use core::ptr::null_mut;

use crate::addr::{VirtualAddress, FRAME_SIZE};
use crate::address_space::{AddressSpace, AddressSpaceError, Granularity};
use crate::board::KERNEL_HEAP_BASE;
use crate::sync::Spinlock;

/// Total virtual span committed to the kernel heap, split 3/4 : 3/16 : 1/16 across the three
/// block pools, mirroring the teacher's split.
const HEAP_SIZE: u32 = 0x20_0000;

/// An intrusive singly-linked free list node, overlaid on a free block's own storage.
struct FreeBlock {
    next: *mut FreeBlock,
}

/// A free-list allocator over fixed `BLOCK_SIZE`-byte blocks.
struct FixedBlockHeap<const BLOCK_SIZE: usize> {
    first_free: *mut FreeBlock,
}

// SAFETY: all access is serialized by the `Spinlock` each pool is stored behind.
unsafe impl<const BLOCK_SIZE: usize> Send for FixedBlockHeap<BLOCK_SIZE> {}

impl<const BLOCK_SIZE: usize> FixedBlockHeap<BLOCK_SIZE> {
    const fn new() -> Self {
        Self { first_free: null_mut() }
    }

    /// # Safety
    /// Implements `GlobalAlloc::alloc`.
    unsafe fn alloc(&mut self, layout: Layout) -> Option<*mut u8> {
        if layout.size() > BLOCK_SIZE || layout.align() > BLOCK_SIZE {
            return None;
        }
        let block = self.first_free;
        if block.is_null() {
            return None;
        }
        // SAFETY: every node on the free list was placed there by `init` or `dealloc`, over
        // memory this pool exclusively owns.
        self.first_free = unsafe { (*block).next };
        Some(block.cast())
    }

    /// # Safety
    /// Implements `GlobalAlloc::dealloc`; `ptr` must have come from a previous `alloc` of this
    /// exact pool.
    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        let node = ptr.cast::<FreeBlock>();
        // SAFETY: caller's contract above.
        unsafe {
            (*node).next = self.first_free;
        }
        self.first_free = node;
    }

    /// Seeds the free list with every `BLOCK_SIZE`-aligned slot in `start..start + size`.
    ///
    /// # Safety
    /// `start..start + size` must be live, exclusively-owned memory for the lifetime of this
    /// pool.
    unsafe fn init(&mut self, start: *mut u8, size: usize) {
        debug_assert!(BLOCK_SIZE.is_power_of_two());
        let mut offset = 0;
        while offset + BLOCK_SIZE <= size {
            // SAFETY: within `start..start + size`, which the caller guarantees is ours.
            let node = unsafe { start.add(offset).cast::<FreeBlock>() };
            unsafe {
                (*node).next = self.first_free;
            }
            self.first_free = node;
            offset += BLOCK_SIZE;
        }
    }
}

/// The general-purpose heap allocator for the kernel.
struct HeapAllocator {
    /// 32-byte blocks.
    b32: Spinlock<FixedBlockHeap<32>>,
    /// 128-byte blocks.
    b128: Spinlock<FixedBlockHeap<128>>,
    /// 512-byte blocks.
    b512: Spinlock<FixedBlockHeap<512>>,
    // Anything larger falls through to a null allocation; no caller in this crate needs one.
}

impl HeapAllocator {
    const fn new() -> Self {
        Self {
            b32: Spinlock::new(FixedBlockHeap::new()),
            b128: Spinlock::new(FixedBlockHeap::new()),
            b512: Spinlock::new(FixedBlockHeap::new()),
        }
    }
}

#[global_allocator]
static KERNEL_HEAP: HeapAllocator = HeapAllocator::new();

// SAFETY: each pool's free list is only ever touched behind its own spinlock.
unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match max(layout.align(), layout.size()) {
            0..=32 => unsafe { self.b32.acquire().alloc(layout) }.unwrap_or(null_mut()),
            33..=128 => unsafe { self.b128.acquire().alloc(layout) }.unwrap_or(null_mut()),
            129..=512 => unsafe { self.b512.acquire().alloc(layout) }.unwrap_or(null_mut()),
            _ => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match max(layout.align(), layout.size()) {
            0..=32 => unsafe { self.b32.acquire().dealloc(ptr) },
            33..=128 => unsafe { self.b128.acquire().dealloc(ptr) },
            129..=512 => unsafe { self.b512.acquire().dealloc(ptr) },
            _ => (),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_pool = max(layout.align(), layout.size());
        let new_pool = max(layout.align(), new_size);
        let same_pool = (old_pool <= 32 && new_pool <= 32)
            || (32 < old_pool && old_pool <= 128 && 32 < new_pool && new_pool <= 128)
            || (128 < old_pool && old_pool <= 512 && 128 < new_pool && new_pool <= 512);
        if same_pool {
            return ptr;
        }
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return null_mut();
        };
        // SAFETY: `new_layout` is well-formed per the check above.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            // SAFETY: the old and new blocks come from disjoint pools or disjoint free-list
            // slots; the caller upholds `dealloc`'s contract on `ptr`/`layout`.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, min(layout.size(), new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}

/// Commits the kernel heap's virtual range in `space` and seeds the three free-list pools.
///
/// Must run after `space` is the active supervisor address space (or at least after its pages
/// are reachable through ordinary loads/stores), and before the first allocation.
pub fn init(space: &AddressSpace<'_, '_>) -> Result<(), AddressSpaceError> {
    let base = VirtualAddress(KERNEL_HEAP_BASE);
    let pages = HEAP_SIZE / FRAME_SIZE;
    space.reserve_allocate_at(base, pages, Granularity::Page)?;

    let start = KERNEL_HEAP_BASE as *mut u8;
    let b512_size = (HEAP_SIZE * 3 / 4) as usize;
    let b128_size = (HEAP_SIZE * 3 / 16) as usize;
    let b32_size = (HEAP_SIZE / 16) as usize;

    // SAFETY: the range just committed above is exclusively owned by the heap from this point
    // on; the three sub-ranges are disjoint and together span exactly `HEAP_SIZE`.
    unsafe {
        KERNEL_HEAP.b512.acquire().init(start, b512_size);
        KERNEL_HEAP.b128.acquire().init(start.add(b512_size), b128_size);
        KERNEL_HEAP.b32.acquire().init(start.add(b512_size + b128_size), b32_size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pool_alloc_dealloc_round_trip() {
        let mut pool: FixedBlockHeap<32> = FixedBlockHeap::new();
        let arena: &'static mut [u8] = vec![0_u8; 128].leak();
        // SAFETY: `arena` is exclusively owned for the test's duration.
        unsafe { pool.init(arena.as_mut_ptr(), arena.len()) };

        let layout = Layout::from_size_align(16, 8).unwrap();
        // SAFETY: `pool` was just initialized above.
        let first = unsafe { pool.alloc(layout) }.expect("pool should have free blocks");
        let second = unsafe { pool.alloc(layout) }.expect("pool should have free blocks");
        assert_ne!(first, second);

        // SAFETY: `first` was returned by this pool's `alloc`.
        unsafe { pool.dealloc(first) };
        // SAFETY: `pool` has a free block again after the dealloc above.
        let reused = unsafe { pool.alloc(layout) }.expect("dealloc'd block should be reusable");
        assert_eq!(reused, first);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut pool: FixedBlockHeap<32> = FixedBlockHeap::new();
        let arena: &'static mut [u8] = vec![0_u8; 64].leak();
        // SAFETY: `arena` is exclusively owned for the test's duration.
        unsafe { pool.init(arena.as_mut_ptr(), arena.len()) };

        let layout = Layout::from_size_align(64, 8).unwrap();
        // SAFETY: `pool` was just initialized above.
        assert!(unsafe { pool.alloc(layout) }.is_none());
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut pool: FixedBlockHeap<32> = FixedBlockHeap::new();
        let arena: &'static mut [u8] = vec![0_u8; 32].leak();
        // SAFETY: `arena` is exclusively owned for the test's duration.
        unsafe { pool.init(arena.as_mut_ptr(), arena.len()) };

        let layout = Layout::from_size_align(16, 8).unwrap();
        // SAFETY: `pool` was just initialized above.
        assert!(unsafe { pool.alloc(layout) }.is_some());
        // SAFETY: same call, now on an empty pool.
        assert!(unsafe { pool.alloc(layout) }.is_none());
    }
}
