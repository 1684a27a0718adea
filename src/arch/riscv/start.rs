use core::arch::asm;
use core::ptr;

use super::asm::{
    r_mhartid, r_sie, w_medeleg, w_mepc, w_mideleg, w_mscratch, w_mtvec, w_satp, w_sie, w_tp, Mie,
    Mstatus,
};
use crate::{
    arch::Sie,
    kernel::kernel_main,
    memlayout::{clint_mtimecmp, CLINT_MTIME},
    param::NCPU,
};

extern "C" {
    // machine-mode timer interrupt vector, in kernelvec.S.
    fn timervec();
}

/// entry.S needs one stack per CPU.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct Stack([[u8; 4096]; NCPU]);

impl Stack {
    const fn new() -> Self {
        Self([[0; 4096]; NCPU])
    }
}

#[no_mangle]
pub static mut stack0: Stack = Stack::new();

/// A scratch area per CPU for machine-mode timer interrupts.
static mut TIMER_SCRATCH: [[usize; 5]; NCPU] = [[0; 5]; NCPU];

/// entry.S jumps here in machine mode on stack0.
#[no_mangle]
pub unsafe extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    let mut x = Mstatus::read();
    x.remove(Mstatus::MPP_MASK);
    x.insert(Mstatus::MPP_S);
    unsafe { x.write() };

    // set M Exception Program Counter to main, for mret.
    // requires gcc -mcmodel=medany
    unsafe { w_mepc(kernel_main as usize) };

    // disable paging for now.
    unsafe { w_satp(0) };

    // delegate all interrupts and exceptions to supervisor mode.
    unsafe { w_medeleg(0xffff) };
    unsafe { w_mideleg(0xffff) };
    unsafe { w_sie(r_sie() | Sie::SEIE | Sie::STIE | Sie::SSIE) };

    // ask for clock interrupts.
    unsafe { timer_init() };

    // keep each CPU's hartid in its tp register, for cpu_id().
    unsafe { w_tp(r_mhartid()) };

    // switch to supervisor mode and jump to main().
    unsafe { asm!("mret", options(noreturn)) }
}

/// Set up to receive timer interrupts in machine mode, which arrive at
/// timervec in kernelvec.S, which turns them into software interrupts for
/// dev_intr() in trap.rs.
unsafe fn timer_init() {
    // each CPU has a separate source of timer interrupts.
    let id = r_mhartid();

    // ask the CLINT for a timer interrupt.
    // cycles; about 1/10th second in qemu.
    let interval = 1_000_000;
    unsafe {
        ptr::write_volatile(
            clint_mtimecmp(id) as *mut usize,
            ptr::read_volatile(CLINT_MTIME as *const usize) + interval,
        );
    }

    // prepare information in scratch[] for timervec.
    // scratch[0..=2] : space for timervec to save registers.
    // scratch[3] : address of CLINT MTIMECMP register.
    // scratch[4] : desired interval (in cycles) between timer interrupts.
    // SAFETY: each hart writes only its own scratch area, once, during boot.
    let scratch = unsafe { &mut *ptr::addr_of_mut!(TIMER_SCRATCH[id]) };
    scratch[3] = clint_mtimecmp(id);
    scratch[4] = interval;
    unsafe { w_mscratch(scratch.as_mut_ptr() as usize) };

    // set the machine-mode trap handler.
    unsafe { w_mtvec(timervec as usize) };

    // enable machine-mode interrupts.
    unsafe { (Mstatus::read() | Mstatus::MIE).write() };

    // enable machine-mode timer interrupts.
    unsafe { (Mie::read() | Mie::MTIE).write() };
}
