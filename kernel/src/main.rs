//! Stage-2 kernel entry point.
//!
//! Linked to run higher-half (`linker.ld` places `.text` at `0x8000_0000`). The bootloader's
//! ELF loader places this binary's segments into a freshly built `AddressSpace` and jumps to
//! this function's address directly — there is no hardware reset here, only a branch from the
//! loader's own code. Grounded on the reference `kernel_entry`: the loader hands over its own
//! still-live `AddressSpace`/`FrameAllocator` by pointer rather than rebuilding them, since the
//! identity overlay that made them reachable pre-jump stays mapped through `TTBR0` afterward.

#![no_std]
#![no_main]

extern crate alloc;

use libkernel::addr::VirtualAddress;
use libkernel::address_space::{AddressSpace, Granularity};
use libkernel::board;
use libkernel::frame_allocator::FrameAllocator;
use libkernel::heap;
use libkernel::panic::{panic, PanicCode};
use libkernel::println;

core::arch::global_asm!(
    r#"
.section .init
.global _start
_start:
    ldr sp, =__stack_top
    bl kernel_entry
1:  wfe
    b 1b
"#
);

/// Entry point the ELF loader jumps to, with the loader's identity overlay, supervisor address
/// space, and frame allocator passed by pointer exactly as the loader left them: still mapped,
/// still owning every frame they have ever handed out.
///
/// # Safety
/// Called exactly once, by the bootloader, with three pointers to address spaces and an
/// allocator it constructed and left permanently mapped (never dropped on its side).
#[no_mangle]
unsafe extern "C" fn kernel_entry(
    identity_overlay: *const AddressSpace<'static, 'static>,
    supervisor_space: *const AddressSpace<'static, 'static>,
    allocator: *const FrameAllocator<'static>,
) -> ! {
    // SAFETY: the loader's contract above; `board::init_uart` only requires the MMIO window be
    // mapped, which the identity overlay still provides.
    unsafe {
        board::init_uart();
    }
    println!("kernel: running from higher-half");

    // SAFETY: the pointers are valid for the program's remaining lifetime per the loader's
    // contract; nothing else accesses them concurrently on a single core.
    let _identity_overlay = unsafe { &*identity_overlay };
    let supervisor_space = unsafe { &*supervisor_space };
    let allocator = unsafe { &*allocator };

    if heap::init(supervisor_space).is_err() {
        panic(PanicCode::NoMemory);
    }
    println!("kernel: heap initialised");

    // Demonstrates the kernel-mode heap is live: a boxed value allocated from it.
    let _scratch = alloc::boxed::Box::new(0_u8);

    let (total, used, free) = allocator.get_mem_stats();
    println!("kernel: memory total={total} used={used} free={free}");

    let _ = supervisor_space.get_block_state(VirtualAddress(board::KERNEL_VIRTUAL_BASE), Granularity::Page);

    loop {
        // SAFETY: `wfe` only affects CPU power state; there is no scheduler yet to wake for.
        unsafe {
            core::arch::asm!("wfe", options(nomem, nostack));
        }
    }
}
