//! Architecture back ends.
//!
//! `riscv` is the real machine: CSR access, the boot/trap/trampoline
//! assembly, and the CLINT timer. `hosted` stands in on every other target
//! so the kernel's logic can be compiled, and unit-tested, on the host; it
//! emulates only what the lock layer needs (a hart id and an interrupt
//! flag per thread).

use bitflags::bitflags;
use cfg_if::cfg_if;

bitflags! {
    /// Supervisor Status Register, sstatus.
    pub struct Sstatus: usize {
        /// Previous mode, 1=Supervisor, 0=User
        const SPP = 1 << 8;

        /// Supervisor Previous Interrupt Enable
        const SPIE = 1 << 5;

        /// User Previous Interrupt Enable
        const UPIE = 1 << 4;

        /// Supervisor Interrupt Enable
        const SIE = 1 << 1;

        /// User Interrupt Enable
        const UIE = 1 << 0;
    }
}

bitflags! {
    /// Supervisor Interrupt Enable, sie.
    pub struct Sie: usize {
        /// external
        const SEIE = 1 << 9;

        /// timer
        const STIE = 1 << 5;

        /// software
        const SSIE = 1 << 1;
    }
}

cfg_if! {
    if #[cfg(all(target_arch = "riscv64", not(test)))] {
        mod riscv;
        pub use self::riscv::*;
    } else {
        mod hosted;
        pub use self::hosted::*;
    }
}
