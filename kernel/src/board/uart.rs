//! Driver for the BCM283x PL011 UART0, used as the kernel's debug console.

use core::fmt::{self, Write};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::{
    register_bitfields, register_structs,
    registers::{Aliased, ReadOnly, ReadWrite, WriteOnly},
};

register_bitfields! {
    u32,
    DR_R [
        DATA OFFSET(0) NUMBITS(8) [],
    ],
    DR_W [
        DATA OFFSET(0) NUMBITS(8) [],
    ],
    FR [
        TXFF OFFSET(5) NUMBITS(1) [
            Nonfull = 0,
            Full = 1,
        ],
        RXFE OFFSET(4) NUMBITS(1) [
            Nonempty = 0,
            Empty = 1,
        ],
    ],
    IBRD [
        IBRD OFFSET(0) NUMBITS(16) [],
    ],
    FBRD [
        FBRD OFFSET(0) NUMBITS(6) [],
    ],
    LCRH [
        WLEN OFFSET(5) NUMBITS(2) [
            Bits8 = 0b11,
        ],
        FEN OFFSET(4) NUMBITS(1) [
            Character = 0,
            Fifo = 1,
        ],
    ],
    CR [
        RXE OFFSET(9) NUMBITS(1) [
            Disabled = 0,
            Enabled = 1,
        ],
        TXE OFFSET(8) NUMBITS(1) [
            Disabled = 0,
            Enabled = 1,
        ],
        UARTEN OFFSET(0) NUMBITS(1) [
            Disabled = 0,
            Enabled = 1,
        ],
    ],
    ICR [
        ALL OFFSET(0) NUMBITS(11) [],
    ],
}

register_structs! {
    pub UartRegisters {
        (0x00 => dr: Aliased<u32, DR_R::Register, DR_W::Register>),
        (0x04 => _reserved0),
        (0x18 => fr: ReadOnly<u32, FR::Register>),
        (0x1C => _reserved1),
        (0x24 => ibrd: ReadWrite<u32, IBRD::Register>),
        (0x28 => fbrd: ReadWrite<u32, FBRD::Register>),
        (0x2C => lcrh: ReadWrite<u32, LCRH::Register>),
        (0x30 => cr: ReadWrite<u32, CR::Register>),
        (0x34 => _reserved2),
        (0x44 => icr: WriteOnly<u32, ICR::Register>),
        (0x48 => @END),
    }
}

/// A driver to operate the UART's reads and writes.
pub struct Uart {
    registers: *mut UartRegisters,
}

// SAFETY: the UART is accessed only through the single global instance guarded by a spinlock.
unsafe impl Send for Uart {}

impl Uart {
    /// Creates a wrapper for the UART at `base_address` and performs the standard init
    /// sequence (disable, clear interrupts, 8N1, FIFO on, enable).
    ///
    /// # Safety
    /// `base_address` must point to a valid, memory-mapped PL011 UART register block, and no
    /// other code may access those registers for as long as the returned value is alive.
    pub const unsafe fn new(base_address: usize) -> Self {
        Self {
            registers: base_address as *mut UartRegisters,
        }
    }

    /// Runs the standard BCM283x UART0 init sequence.
    pub fn init(&mut self) {
        let registers = self.registers();
        registers.cr.write(CR::UARTEN::Disabled);
        registers.icr.write(ICR::ALL.val(0x7FF));
        registers.lcrh.write(LCRH::WLEN::Bits8 + LCRH::FEN::Fifo);
        registers
            .cr
            .write(CR::RXE::Enabled + CR::TXE::Enabled + CR::UARTEN::Enabled);
    }

    /// Sets the integral and fractional baud rate divisors.
    pub fn set_divider(&mut self, integral: u16, fractional: u8) {
        let registers = self.registers();
        registers.ibrd.write(IBRD::IBRD.val(integral.into()));
        registers.fbrd.write(FBRD::FBRD.val(fractional.into()));
    }

    fn registers(&self) -> &UartRegisters {
        // SAFETY: constructed from a valid register base per `new`'s contract.
        unsafe { &*self.registers }
    }

    /// Writes a single byte, spinning until the transmit FIFO has room.
    pub fn write_byte(&mut self, byte: u8) {
        let registers = self.registers();
        while registers.fr.matches_any(FR::TXFF::Full) {
            core::hint::spin_loop();
        }
        registers.dr.write(DR_W::DATA.val(byte.into()));
    }

    /// Reads a single byte, spinning until the receive FIFO has data.
    pub fn read_byte(&mut self) -> u8 {
        let registers = self.registers();
        while registers.fr.matches_any(FR::RXFE::Empty) {
            core::hint::spin_loop();
        }
        registers.dr.read(DR_R::DATA) as u8
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.as_bytes() {
            if *byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(*byte);
        }
        Ok(())
    }
}
