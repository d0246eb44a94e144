//! Translation between a `PhysicalAddress` and a pointer the CPU can actually dereference.
//!
//! Before the MMU is enabled, physical memory is identity-mapped, so a physical address and a
//! pointer are numerically the same. Host tests have no such identity mapping (the addresses
//! the frame allocator hands out are small integers, not valid pointers into the test process),
//! so they back "physical memory" with an ordinary heap allocation and supply its base here
//! instead. Either way, `AddressSpace` and the ELF loader go through this type rather than
//! casting a `PhysicalAddress` directly.

use crate::addr::PhysicalAddress;

/// A base to add to a `PhysicalAddress` to get a dereferenceable pointer.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalMemory {
    base: usize,
}

impl PhysicalMemory {
    /// Physical addresses are pointers, unmodified. Used on the real target before paging.
    pub const IDENTITY: Self = Self { base: 0 };

    /// Backs physical memory with an arena starting at `base`. Used by host tests.
    pub const fn with_base(base: usize) -> Self {
        Self { base }
    }

    pub fn as_mut_ptr(self, address: PhysicalAddress) -> *mut u8 {
        self.base.wrapping_add(address.0 as usize) as *mut u8
    }

    /// Reinterprets `len` elements of physical memory starting at `address` as `&mut [T]`.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of `address..address + len * size_of::<T>()`,
    /// and that range must be validly aligned and sized for `T`.
    pub unsafe fn slice_mut<T>(self, address: PhysicalAddress, len: usize) -> &'static mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(address).cast::<T>(), len) }
    }
}
