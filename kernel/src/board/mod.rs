//! Board-specific memory layout and peripheral addresses, kept in one place rather than
//! scattered as magic numbers through the boot code.

pub mod uart;

use crate::sync::{Spinlock, SpinlockGuard};
use uart::Uart;

/// Physical base of the BCM283x peripheral MMIO window (Raspberry Pi 1/Zero).
pub const MMIO_BASE: u32 = 0x2000_0000;

/// Physical base of UART0 (PL011).
pub const UART0_BASE: u32 = MMIO_BASE + 0x0020_1000;

/// Size, in bytes, of the MMIO window the identity overlay must map.
pub const MMIO_SIZE: u32 = 0x0100_0000;

/// Virtual address at which the higher-half kernel image is linked to run.
pub const KERNEL_VIRTUAL_BASE: u32 = 0x8000_0000;

/// First virtual address handed out to Page-granularity reservations in the supervisor space,
/// immediately above the kernel image itself.
pub const KERNEL_HEAP_BASE: u32 = 0x8100_0000;

static UART: Spinlock<Option<Uart>> = Spinlock::new(None);

/// Initialises the global UART instance. Must be called exactly once, before `serial()` or the
/// `print!`/`println!` macros are used.
///
/// # Safety
/// Must only be called once, and only when the MMIO window is actually mapped and accessible
/// (either pre-MMU, or post-MMU with the peripheral range mapped Device).
pub unsafe fn init_uart() {
    // SAFETY: caller guarantees the MMIO window is live.
    let mut uart = unsafe { Uart::new(UART0_BASE as usize) };
    uart.init();
    *UART.acquire() = Some(uart);
}

/// Returns a guard granting exclusive access to the global UART, for use by the `print!` family.
pub fn serial() -> SpinlockGuard<'static, Option<Uart>> {
    UART.acquire()
}
