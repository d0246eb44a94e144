//! `print!`/`println!` over the board's UART, compiled out unless the `verbose` feature is on.

use core::fmt::Write;

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    if let Some(uart) = board::serial().as_mut() {
        let _ignored = uart.write_fmt(args);
    }
}

use crate::board;

/// Prints to the boot console, gated behind the `verbose` feature.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        #[cfg(feature = "verbose")]
        $crate::print::_print(format_args!($($arg)*));
        #[cfg(not(feature = "verbose"))]
        let _ = format_args!($($arg)*);
    };
}

/// Prints a line to the boot console, gated behind the `verbose` feature.
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        #[cfg(feature = "verbose")]
        {
            $crate::print::_print(format_args!($($arg)*));
            $crate::print::_print(format_args!("\n"));
        }
        #[cfg(not(feature = "verbose"))]
        let _ = format_args!($($arg)*);
    };
}
