mod asm;
mod start;
mod vectors;

use core::ptr::addr_of;

pub use asm::*;
pub use start::start;

use crate::proc::Context;

extern "C" {
    // swtch.S
    fn swtch(old: *mut Context, new: *mut Context);

    // kernelvec.S
    fn kernelvec();

    // trampoline.S
    static mut trampoline: [u8; 0];
    static mut uservec: [u8; 0];
    static mut userret: [u8; 0];

    // kernel.ld sets these.
    static mut etext: [u8; 0];
    static mut end: [u8; 0];
}

/// Saves the current context in `old` and switches to `new`.
///
/// # Safety
///
/// Both pointers must refer to valid, distinct `Context`s, and `new` must
/// have been filled in by a previous `context_switch` or by process setup.
pub unsafe fn context_switch(old: *mut Context, new: *mut Context) {
    unsafe { swtch(old, new) }
}

/// Installs the kernel trap vector.
pub unsafe fn write_kernel_vector() {
    unsafe { w_stvec(kernelvec as usize) }
}

/// The address of the trampoline page's code in the kernel image.
pub fn trampoline_addr() -> usize {
    // SAFETY: safe to take only the address of a static.
    unsafe { addr_of!(trampoline) as usize }
}

/// The offset of the user trap entry within the trampoline page.
pub fn uservec_offset() -> usize {
    // SAFETY: safe to take only the address of a static.
    unsafe { addr_of!(uservec) as usize - addr_of!(trampoline) as usize }
}

/// The offset of the return-to-user code within the trampoline page.
pub fn userret_offset() -> usize {
    // SAFETY: safe to take only the address of a static.
    unsafe { addr_of!(userret) as usize - addr_of!(trampoline) as usize }
}

/// First address after kernel code, set by kernel.ld.
pub fn text_end() -> usize {
    // SAFETY: safe to take only the address of a static.
    unsafe { addr_of!(etext) as usize }
}

/// First address after the kernel image, set by kernel.ld.
pub fn kernel_end() -> usize {
    // SAFETY: safe to take only the address of a static.
    unsafe { addr_of!(end) as usize }
}
