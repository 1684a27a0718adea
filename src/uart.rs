//! Low-level driver routines for the 16550a UART.
use core::ptr;

use self::UartCtrlRegs::{FCR, IER, ISR, LCR, LSR, RBR, THR};
use crate::{
    cpu::{pop_off, push_off},
    kernel::kernel_builder,
    lock::{Sleepablelock, SleepablelockGuard},
    memlayout::UART0,
};

const UART_TX_BUF_SIZE: usize = 32;

enum UartRegBits {
    IerTxEnable,
    IerRxEnable,
    FcrFifoEnable,
    FcrFifoClear,
    LcrEightBits,
    LcrBaudLatch,
    LsrRxReady,
    LsrTxIdle,
}

impl UartRegBits {
    fn bits(self) -> u8 {
        match self {
            UartRegBits::FcrFifoEnable
            | UartRegBits::IerRxEnable
            // Input is waiting to be read from RHR.
            | UartRegBits::LsrRxReady => 1 << 0,
            UartRegBits::IerTxEnable => 1 << 1,
            // Clear the content of the two FIFOs.
            UartRegBits::FcrFifoClear => 3 << 1,
            UartRegBits::LcrEightBits => 3,
            // Special mode to set baud rate.
            UartRegBits::LcrBaudLatch => 1 << 7,
            // THR can accept another character to send.
            UartRegBits::LsrTxIdle => 1 << 5,
        }
    }
}

/// The UART control registers. Some have different meanings for read vs
/// write. See http://byterunner.com/16550.html
#[repr(usize)]
enum UartCtrlRegs {
    /// Receive Buffer Register.
    RBR,
    /// Transmit Holding Register (for output bytes).
    THR,
    /// Interrupt Enable Register.
    IER,
    /// FIFO Control Register.
    FCR,
    /// Interrupt Status Register.
    ISR,
    /// Line Control Register.
    LCR,
    /// Line Status Register.
    LSR,
}

impl UartCtrlRegs {
    /// The UART control registers are memory-mapped at address UART0.
    fn reg(self) -> *mut u8 {
        match self {
            THR | RBR => UART0 as *mut u8,
            IER => (UART0 + 1) as *mut u8,
            FCR | ISR => (UART0 + 2) as *mut u8,
            LCR => (UART0 + 3) as *mut u8,
            LSR => (UART0 + 5) as *mut u8,
        }
    }

    fn read(self) -> u8 {
        // SAFETY: the register is mapped at a fixed address.
        unsafe { ptr::read_volatile(self.reg()) }
    }

    fn write(self, v: u8) {
        // SAFETY: the register is mapped at a fixed address.
        unsafe { ptr::write_volatile(self.reg(), v) }
    }
}

/// The transmit ring buffer.
pub struct UartTx {
    buf: [u8; UART_TX_BUF_SIZE],

    /// Write next to buf[w % UART_TX_BUF_SIZE].
    w: u64,

    /// Read next from buf[r % UART_TX_BUF_SIZE].
    r: u64,
}

pub struct Uart {
    tx: Sleepablelock<UartTx>,
}

impl Uart {
    pub const fn new() -> Self {
        Self {
            tx: Sleepablelock::new(
                "uart",
                UartTx {
                    buf: [0; UART_TX_BUF_SIZE],
                    w: 0,
                    r: 0,
                },
            ),
        }
    }

    pub fn init() {
        // Disable interrupts.
        IER.write(0x00);

        // Special mode to set baud rate.
        LCR.write(UartRegBits::LcrBaudLatch.bits());

        // LSB for baud rate of 38.4K.
        RBR.write(0x03);

        // MSB for baud rate of 38.4K.
        IER.write(0x00);

        // Leave set-baud mode, and set word length to 8 bits, no parity.
        LCR.write(UartRegBits::LcrEightBits.bits());

        // Reset and enable FIFOs.
        FCR.write(UartRegBits::FcrFifoEnable.bits() | UartRegBits::FcrFifoClear.bits());

        // Enable transmit and receive interrupts.
        IER.write(UartRegBits::IerTxEnable.bits() | UartRegBits::IerRxEnable.bits());
    }

    /// Adds a character to the output buffer and tells the UART to start
    /// sending if it isn't already. Blocks if the output buffer is full;
    /// since it may block, it cannot be called from interrupts, only from
    /// write().
    pub fn putc(&self, c: u8) {
        let mut tx = self.tx.lock();
        if kernel_builder().is_panicked() {
            loop {
                core::hint::spin_loop();
            }
        }
        loop {
            if tx.w == tx.r + UART_TX_BUF_SIZE as u64 {
                // Buffer is full; wait for start() to open up space.
                tx.sleep();
            } else {
                let w = tx.w;
                tx.buf[w as usize % UART_TX_BUF_SIZE] = c;
                tx.w += 1;
                self.start(tx);
                return;
            }
        }
    }

    /// Alternate version of putc() that doesn't use interrupts, for use by
    /// kernel printing and to echo characters. It spins waiting for the
    /// UART's output register to be empty.
    pub fn putc_sync(c: u8) {
        push_off();
        if kernel_builder().is_panicked() {
            loop {
                core::hint::spin_loop();
            }
        }

        // Wait for Transmit Holding Empty to be set in LSR.
        while LSR.read() & UartRegBits::LsrTxIdle.bits() == 0 {}

        THR.write(c);

        pop_off();
    }

    /// If the UART is idle and a character is waiting in the transmit
    /// buffer, sends it. Called from both the top and bottom half.
    fn start(&self, mut tx: SleepablelockGuard<'_, UartTx>) {
        loop {
            if tx.w == tx.r {
                // Transmit buffer is empty.
                return;
            }

            if LSR.read() & UartRegBits::LsrTxIdle.bits() == 0 {
                // The UART transmit holding register is full; it will
                // interrupt when it's ready for a new byte.
                return;
            }

            let r = tx.r;
            let c = tx.buf[r as usize % UART_TX_BUF_SIZE];
            tx.r += 1;

            // Maybe putc() is waiting for space in the buffer.
            tx.wakeup();

            THR.write(c);
        }
    }

    /// Reads one input character from the UART.
    /// Returns None if none is waiting.
    fn getc() -> Option<u8> {
        if LSR.read() & UartRegBits::LsrRxReady.bits() != 0 {
            // Input data is ready.
            Some(RBR.read())
        } else {
            None
        }
    }

    /// Handles a UART interrupt, raised because input has arrived, or the
    /// UART is ready for more output, or both.
    pub fn intr(&self) {
        // Read and process incoming characters.
        while let Some(c) = Uart::getc() {
            crate::console::intr(c);
        }

        // Send buffered characters.
        self.start(self.tx.lock());
    }
}
