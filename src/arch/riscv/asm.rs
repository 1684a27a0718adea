//! RISC-V CSR and instruction wrappers.

use core::arch::asm;

use bitflags::bitflags;

use crate::arch::{Sie, Sstatus};

/// Which hart (core) is this?
#[inline]
pub fn r_mhartid() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, mhartid", x = out(reg) x);
    }
    x
}

bitflags! {
    /// Machine Status Register, mstatus.
    pub struct Mstatus: usize {
        /// Previous mode.
        const MPP_MASK = 3 << 11;
        const MPP_M = 3 << 11;
        const MPP_S = 1 << 11;
        const MPP_U = 0 << 11;
        /// Machine-mode interrupt enable.
        const MIE = 1 << 3;
    }
}

impl Mstatus {
    #[inline]
    pub fn read() -> Self {
        let mut x;
        unsafe {
            asm!("csrr {x}, mstatus", x = out(reg) x);
        }
        Self::from_bits_truncate(x)
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe {
            asm!("csrw mstatus, {x}", x = in(reg) self.bits());
        }
    }
}

bitflags! {
    /// Machine-mode Interrupt Enable, mie.
    pub struct Mie: usize {
        /// external
        const MEIE = 1 << 11;

        /// timer
        const MTIE = 1 << 7;

        /// software
        const MSIE = 1 << 3;
    }
}

impl Mie {
    #[inline]
    pub fn read() -> Self {
        let mut x;
        unsafe {
            asm!("csrr {x}, mie", x = out(reg) x);
        }
        Self::from_bits_truncate(x)
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe {
            asm!("csrw mie, {x}", x = in(reg) self.bits());
        }
    }
}

/// Machine exception program counter; holds the instruction address to which
/// mret returns.
#[inline]
pub unsafe fn w_mepc(x: usize) {
    unsafe {
        asm!("csrw mepc, {x}", x = in(reg) x);
    }
}

#[inline]
pub fn r_sstatus() -> Sstatus {
    let mut x;
    unsafe {
        asm!("csrr {x}, sstatus", x = out(reg) x);
    }
    Sstatus::from_bits_truncate(x)
}

#[inline]
pub unsafe fn w_sstatus(x: Sstatus) {
    unsafe {
        asm!("csrw sstatus, {x}", x = in(reg) x.bits());
    }
}

/// Supervisor Interrupt Pending.
#[inline]
pub fn r_sip() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, sip", x = out(reg) x);
    }
    x
}

#[inline]
pub unsafe fn w_sip(x: usize) {
    unsafe {
        asm!("csrw sip, {x}", x = in(reg) x);
    }
}

#[inline]
pub fn r_sie() -> Sie {
    let mut x;
    unsafe {
        asm!("csrr {x}, sie", x = out(reg) x);
    }
    Sie::from_bits_truncate(x)
}

#[inline]
pub unsafe fn w_sie(x: Sie) {
    unsafe {
        asm!("csrw sie, {x}", x = in(reg) x.bits());
    }
}

/// Supervisor exception program counter; holds the instruction address to
/// which a return from exception will go.
#[inline]
pub unsafe fn w_sepc(x: usize) {
    unsafe {
        asm!("csrw sepc, {x}", x = in(reg) x);
    }
}

#[inline]
pub fn r_sepc() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, sepc", x = out(reg) x);
    }
    x
}

/// Machine Exception Delegation.
#[inline]
pub unsafe fn w_medeleg(x: usize) {
    unsafe {
        asm!("csrw medeleg, {x}", x = in(reg) x);
    }
}

/// Machine Interrupt Delegation.
#[inline]
pub unsafe fn w_mideleg(x: usize) {
    unsafe {
        asm!("csrw mideleg, {x}", x = in(reg) x);
    }
}

/// Supervisor Trap-Vector Base Address; low two bits are mode.
#[inline]
pub unsafe fn w_stvec(x: usize) {
    unsafe {
        asm!("csrw stvec, {x}", x = in(reg) x);
    }
}

/// Machine-mode interrupt vector.
#[inline]
pub unsafe fn w_mtvec(x: usize) {
    unsafe {
        asm!("csrw mtvec, {x}", x = in(reg) x);
    }
}

/// Supervisor address translation and protection; holds the address of the
/// page table.
#[inline]
pub unsafe fn w_satp(x: usize) {
    unsafe {
        asm!("csrw satp, {x}", x = in(reg) x);
    }
}

#[inline]
pub fn r_satp() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, satp", x = out(reg) x);
    }
    x
}

/// Machine-mode scratch register, for the machine-mode timer handler.
#[inline]
pub unsafe fn w_mscratch(x: usize) {
    unsafe {
        asm!("csrw mscratch, {x}", x = in(reg) x);
    }
}

/// Supervisor Trap Cause.
#[inline]
pub fn r_scause() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, scause", x = out(reg) x);
    }
    x
}

/// Supervisor Trap Value.
#[inline]
pub fn r_stval() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, stval", x = out(reg) x);
    }
    x
}

/// Enable device interrupts.
#[inline]
pub unsafe fn intr_on() {
    unsafe { w_sstatus(r_sstatus() | Sstatus::SIE) }
}

/// Disable device interrupts.
#[inline]
pub unsafe fn intr_off() {
    unsafe { w_sstatus(r_sstatus() - Sstatus::SIE) }
}

/// Are device interrupts enabled?
#[inline]
pub fn intr_get() -> bool {
    r_sstatus().contains(Sstatus::SIE)
}

/// Read tp, the thread pointer, which holds this core's hartid (core
/// number), the index into cpus[].
#[inline]
pub fn r_tp() -> usize {
    let mut x;
    unsafe {
        asm!("mv {x}, tp", x = out(reg) x);
    }
    x
}

#[inline]
pub unsafe fn w_tp(x: usize) {
    unsafe {
        asm!("mv tp, {x}", x = in(reg) x);
    }
}

/// This hart's id. Valid as an index into per-cpu state only while
/// interrupts are disabled; see `Cpus`.
#[inline]
pub fn cpu_id() -> usize {
    r_tp()
}

/// Flush the TLB. The zero, zero means flush all TLB entries.
#[inline]
pub unsafe fn sfence_vma() {
    unsafe {
        asm!("sfence.vma zero, zero");
    }
}
