//! Console glue: echoes UART input and services the control keys. There is
//! no file system in this kernel, so console input drives nothing beyond
//! the echo and the process-table dump.

use crate::{kernel::kernel_builder, uart::Uart};

/// The erase sequence a terminal understands: back up, blank, back up.
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

const fn ctrl(c: u8) -> u8 {
    c - b'@'
}

/// Sends one character to the UART, rendering erase properly.
pub fn putc(c: u8) {
    if c == BACKSPACE || c == DELETE {
        // Overwrite the erased character with a space.
        Uart::putc_sync(BACKSPACE);
        Uart::putc_sync(b' ');
        Uart::putc_sync(BACKSPACE);
    } else {
        Uart::putc_sync(c);
    }
}

/// The console input interrupt handler; uart.intr() calls this for each
/// input character.
pub fn intr(c: u8) {
    match c {
        // Print the process list.
        c if c == ctrl(b'P') => kernel_builder().procs.dump(),
        b'\r' => putc(b'\n'),
        _ => putc(c),
    }
}
