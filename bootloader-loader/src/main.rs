//! Stage-1 loader: the only code that ever runs with the MMU off.
//!
//! Firmware drops us at the standard 32-bit kernel.img load address (`linker.ld` places `.init`
//! at `0x8000`) with `r0` = 0, `r1` = machine type, `r2` = a pointer to an ATAG chain, and `r3`
//! = the CPSR firmware handed control over with. All four are part of the documented entry ABI
//! (mirroring the reference loader's `loader_main(r0, r1, atags, cpsr_saved)`), so `_start`
//! preserves all four across its own work even though `loader_main` only acts on the first
//! three. `_start` first checks whether it is actually running from its linked address and, if
//! not, copies itself
//! there before continuing — chain-loaders (U-Boot, a prior-stage relocator) do not all place the
//! image at the address it was linked for. From there: parse the ATAGs for the RAM size, build
//! the frame allocator, build an identity overlay (RAM + the MMIO window) and a fresh supervisor
//! address space, load the embedded kernel ELF into the latter, enable the MMU, and jump to the
//! kernel's entry point with the identity overlay, supervisor space, and allocator handed over by
//! pointer — mirroring the reference loader's `entry_proc(&identity_overlay, &supervisor_table,
//! &page_alloc)`, where those are never-dropped locals still reachable because the identity
//! overlay keeps the loader's own stack mapped after the jump.

#![no_std]
#![no_main]

use libkernel::addr::{PhysicalAddress, FRAME_SIZE};
use libkernel::address_space::{AddressSpace, Granularity};
use libkernel::board;
use libkernel::boot::atags;
use libkernel::elf;
use libkernel::frame_allocator::FrameAllocator;
use libkernel::panic::{panic, PanicCode};
use libkernel::paging::PagingController;
use libkernel::phys_mem::PhysicalMemory;
use libkernel::println;

core::arch::global_asm!(
    r#"
.section .init
.global _start
_start:
    mov r4, r0
    mov r5, r1
    mov r6, r2
    mov r8, r3

    @ self-relocation: compare where we are actually running to where we were linked to run.
    @ r7 is used as scratch by the copy loop below; r4-r6 and r8 (the original r0-r3) survive
    @ across it untouched.
    @ only .init/.text/.rodata/.data are file-backed and need copying; .bss is zeroed below
    @ regardless of whether relocation ran.
    adr r0, _start
    ldr r1, =__image_start
    cmp r0, r1
    beq .Lzero_bss

    ldr r2, =__bss_start
    sub r2, r2, r1
    mov r3, r1
.Lrelocate_loop:
    cmp r2, #0
    ble .Lrelocate_done
    ldr r7, [r0], #4
    str r7, [r3], #4
    sub r2, r2, #4
    b .Lrelocate_loop
.Lrelocate_done:
    @ jump into the copy we just made at its linked address: everything from here on must run
    @ from the relocated location, since `bl`/PC-relative branches below assume it.
    ldr r0, =.Lzero_bss
    bx r0

.Lzero_bss:
    ldr r0, =__bss_start
    ldr r1, =__bss_end
    mov r2, #0
.Lzero_bss_loop:
    cmp r0, r1
    bge .Lpost_relocate
    str r2, [r0], #4
    b .Lzero_bss_loop

.Lpost_relocate:
    ldr sp, =__stack_top
    mov r0, r4
    mov r1, r5
    mov r2, r6
    mov r3, r8
    bl loader_main
.Lhang:
    wfe
    b .Lhang
"#
);

/// The embedded, already-cross-compiled kernel image, objcopied to a raw binary by `xtask` and
/// wired in through `build.rs`'s `EMBEDDED_KERNEL_PATH`. The Rust-native equivalent of the
/// reference loader's `_binary_kernel_stripped_elf_start` linker symbol.
static EMBEDDED_KERNEL: &[u8] = include_bytes!(env!("EMBEDDED_KERNEL_PATH"));

/// Number of frames the refcount table below can describe: up to 256 MiB of RAM, comfortably
/// above anything a Raspberry Pi 1/Zero/2 board ships with.
const MAX_FRAMES: usize = (256 * 1024 * 1024) / FRAME_SIZE as usize;

/// Backing storage for the frame allocator's refcount table. Declared here (rather than found by
/// a linker symbol, as the reference loader does with `__page_alloc_table_start`) because a
/// `static` gives it a fixed, known-at-link-time physical address without a bespoke section.
static mut REFCOUNT_TABLE: [u8; MAX_FRAMES] = [0; MAX_FRAMES];

/// Function pointer type of the kernel's entry point: an `AddressSpace` for the identity overlay,
/// one for the supervisor space, and the frame allocator, all handed over by pointer and never
/// dropped on this side.
type KernelEntry = unsafe extern "C" fn(
    *const AddressSpace<'static, 'static>,
    *const AddressSpace<'static, 'static>,
    *const FrameAllocator<'static>,
) -> !;

#[no_mangle]
extern "C" fn loader_main(_r0: u32, _r1: u32, atags_ptr: *const u32, _saved_cpsr: u32) -> ! {
    // SAFETY: the MMU is off and MMIO is identity-accessible; called exactly once, at boot.
    unsafe {
        board::init_uart();
    }
    println!("bootloader-loader: starting");

    // SAFETY: firmware hands us a valid, ATAG_NONE-terminated chain at this pointer.
    let memory = unsafe { atags::parse(atags_ptr) };
    println!("bootloader-loader: ram size={:#x}", memory.size);

    let num_frames = memory.size / FRAME_SIZE;
    // SAFETY: `num_frames` is bounded by the board's actual RAM, well under `MAX_FRAMES` for
    // every Raspberry Pi 1/Zero/2 configuration; this is the loader's only access to the table,
    // taken once and never aliased.
    let refcount_table_base;
    let refcounts: &'static mut [u8] = unsafe {
        let table_ptr = core::ptr::addr_of_mut!(REFCOUNT_TABLE).cast::<u8>();
        refcount_table_base = PhysicalAddress(table_ptr as u32);
        core::slice::from_raw_parts_mut(table_ptr, num_frames as usize)
    };
    let allocator = FrameAllocator::new(memory.size, refcount_table_base, refcounts);

    let identity_overlay = AddressSpace::new_identity_overlay(&allocator, PhysicalMemory::IDENTITY);
    identity_map_ram(&identity_overlay, memory.size);
    identity_map_mmio(&identity_overlay);

    let supervisor_space = AddressSpace::new_supervisor(&allocator, PhysicalMemory::IDENTITY);
    let loaded = elf::load(EMBEDDED_KERNEL, &supervisor_space, PhysicalMemory::IDENTITY)
        .unwrap_or_else(|_| panic(PanicCode::AssertionFailure));
    println!("bootloader-loader: kernel entry={}", loaded.entry);

    PagingController::set_lower(&identity_overlay);
    PagingController::set_upper(&supervisor_space);
    PagingController::set_mode(true, true);
    // SAFETY: `identity_overlay` maps the program counter's current (identity) address, so
    // execution survives the MMU turning on.
    unsafe {
        PagingController::enable();
    }
    println!("bootloader-loader: paging enabled");

    // SAFETY: `loaded.entry` is the kernel's validated ELF entry point, now reachable through
    // `supervisor_space`'s upper-half mapping; the three pointers below outlive the call because
    // none of `identity_overlay`, `supervisor_space`, or `allocator` is ever dropped — this
    // function diverges instead of returning.
    let entry: KernelEntry = unsafe { core::mem::transmute(loaded.entry.0 as usize) };
    let identity_ptr = (&identity_overlay as *const AddressSpace<'_, '_>).cast::<AddressSpace<'static, 'static>>();
    let supervisor_ptr = (&supervisor_space as *const AddressSpace<'_, '_>).cast::<AddressSpace<'static, 'static>>();
    let allocator_ptr = (&allocator as *const FrameAllocator<'_>).cast::<FrameAllocator<'static>>();

    // SAFETY: the loader contract above; this call never returns.
    unsafe {
        entry(identity_ptr, supervisor_ptr, allocator_ptr);
    }
}

/// Identity-maps every section of physical RAM covered by `ram_size`.
fn identity_map_ram(overlay: &AddressSpace<'_, '_>, ram_size: u32) {
    let sections = ram_size.div_ceil(Granularity::Section.stride_bytes());
    overlay
        .reserve_at_granularity(libkernel::addr::VirtualAddress(0), sections, Granularity::Section)
        .unwrap_or_else(|_| panic(PanicCode::AssertionFailure));
    overlay
        .map(libkernel::addr::VirtualAddress(0), PhysicalAddress(0), sections, Granularity::Section)
        .unwrap_or_else(|_| panic(PanicCode::AssertionFailure));
}

/// Identity-maps the BCM283x peripheral MMIO window so UART and the rest of the board code keep
/// working once paging is live.
fn identity_map_mmio(overlay: &AddressSpace<'_, '_>) {
    let sections = board::MMIO_SIZE / Granularity::Section.stride_bytes();
    let base = libkernel::addr::VirtualAddress(board::MMIO_BASE);
    overlay
        .reserve_at_granularity(base, sections, Granularity::Section)
        .unwrap_or_else(|_| panic(PanicCode::AssertionFailure));
    overlay
        .map(base, PhysicalAddress(board::MMIO_BASE), sections, Granularity::Section)
        .unwrap_or_else(|_| panic(PanicCode::AssertionFailure));
}
