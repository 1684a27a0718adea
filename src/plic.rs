//! The riscv Platform Level Interrupt Controller (PLIC).

use core::ptr;

use crate::{
    arch,
    memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ, VIRTIO0_IRQ},
};

/// Sets desired IRQ priorities non-zero (otherwise disabled).
pub unsafe fn init() {
    unsafe {
        ptr::write_volatile((PLIC + UART0_IRQ * 4) as *mut u32, 1);
        ptr::write_volatile((PLIC + VIRTIO0_IRQ * 4) as *mut u32, 1);
    }
}

/// Asks the PLIC to deliver the uart and virtio interrupts to this hart.
pub unsafe fn init_hart() {
    let hart = arch::cpu_id();

    unsafe {
        // Set the enable bits for this hart's S-mode.
        ptr::write_volatile(
            plic_senable(hart) as *mut u32,
            (1 << UART0_IRQ | 1 << VIRTIO0_IRQ) as u32,
        );

        // Set this hart's S-mode priority threshold to 0.
        ptr::write_volatile(plic_spriority(hart) as *mut u32, 0);
    }
}

/// Asks the PLIC what interrupt we should serve.
pub fn claim() -> u32 {
    let hart = arch::cpu_id();
    // SAFETY: the claim register is mapped and hart-local.
    unsafe { ptr::read_volatile(plic_sclaim(hart) as *const u32) }
}

/// Tells the PLIC we've served this IRQ.
pub fn complete(irq: u32) {
    let hart = arch::cpu_id();
    // SAFETY: the claim register is mapped and hart-local.
    unsafe { ptr::write_volatile(plic_sclaim(hart) as *mut u32, irq) }
}
