//! Trap handling: entry from user space, traps taken in the kernel, device
//! and timer interrupt dispatch, and the per-process alarm.

use core::mem;

use crate::{
    addr::PGSIZE,
    arch::{self, Sstatus},
    kernel::kernel_builder,
    memlayout::{TRAMPOLINE, TRAPFRAME, UART0_IRQ, VIRTIO0_IRQ},
    plic,
    proc::{myproc, Alarm, CurrentProc, Procstate, TrapFrame},
    println,
};

/// The interrupt bit of scause.
const SCAUSE_INTERRUPT: usize = 1 << 63;

/// scause for an environment call from U-mode.
const SCAUSE_USER_ECALL: usize = 8;

/// Exception code of a supervisor external interrupt (via the PLIC).
const SCAUSE_EXTERNAL: usize = 9;

/// Exception code of a supervisor software interrupt; machine mode forwards
/// its timer interrupts as these.
const SCAUSE_SOFTWARE: usize = 1;

/// What a trap turned out to be, decoded from scause. The dispatchers match
/// on this instead of repeating bit tests.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TrapKind {
    /// ecall from user space.
    Syscall,

    /// An external device interrupt, delivered by the PLIC.
    DeviceInterrupt,

    /// A machine-forwarded timer tick.
    TimerInterrupt,

    /// Anything else; a fault or a bug.
    Unknown(usize),
}

impl TrapKind {
    pub fn decode(scause: usize) -> TrapKind {
        if scause == SCAUSE_USER_ECALL {
            TrapKind::Syscall
        } else if scause & SCAUSE_INTERRUPT != 0 && scause & 0xff == SCAUSE_EXTERNAL {
            TrapKind::DeviceInterrupt
        } else if scause == SCAUSE_INTERRUPT | SCAUSE_SOFTWARE {
            TrapKind::TimerInterrupt
        } else {
            TrapKind::Unknown(scause)
        }
    }
}

/// Sets up to take exceptions and traps while in the kernel.
pub unsafe fn trap_init_hart() {
    unsafe { arch::write_kernel_vector() };
}

/// Handles an interrupt, exception, or system call from user space.
/// Called from the trampoline, which put us on the process's kernel stack
/// with the kernel page table installed.
#[no_mangle]
pub unsafe extern "C" fn usertrap() -> ! {
    assert!(
        !arch::r_sstatus().contains(Sstatus::SPP),
        "usertrap: not from user mode"
    );

    // Send interrupts and exceptions to kerneltrap(), since we're now in
    // the kernel. The trampoline vector must not service traps from here.
    unsafe { arch::write_kernel_vector() };

    let mut p = myproc().expect("usertrap: no process");

    // Save user program counter.
    // SAFETY: the trap-frame page belongs to this process.
    unsafe { (*p.data().trap_frame).epc = arch::r_sepc() };

    let kind = TrapKind::decode(arch::r_scause());
    match kind {
        TrapKind::Syscall => {
            if p.killed() {
                kernel_builder().procs.exit_current(&mut p, -1);
            }

            // sepc points to the ecall instruction, but we want to return
            // to the next instruction.
            // SAFETY: as above.
            unsafe { (*p.data().trap_frame).epc += 4 };

            // An interrupt will change sepc, scause, and sstatus, so don't
            // enable until done with those registers.
            // SAFETY: the trap registers have been read.
            unsafe { arch::intr_on() };

            crate::syscall::syscall(&mut p);
        }
        TrapKind::DeviceInterrupt => handle_device_interrupt(),
        TrapKind::TimerInterrupt => {
            acknowledge_timer();

            // Deliver the process's alarm if its deadline has passed.
            let ticks = *kernel_builder().ticks.lock();
            let data = p.data();
            // SAFETY: the trap-frame page belongs to this process.
            let trap_frame = unsafe { &mut *data.trap_frame };
            let _ = alarm_fire(&mut data.alarm, trap_frame, ticks);
        }
        TrapKind::Unknown(scause) => {
            let pid = p.pid();
            println!("usertrap(): unexpected scause {:#x} pid={}", scause, pid);
            println!(
                "            sepc={:#x} stval={:#x}",
                arch::r_sepc(),
                arch::r_stval()
            );
            p.kill();
        }
    }

    if p.killed() {
        kernel_builder().procs.exit_current(&mut p, -1);
    }

    // Give up the CPU if this is a timer interrupt.
    if kind == TrapKind::TimerInterrupt {
        p.yield_cpu();
    }

    unsafe { usertrapret(p) }
}

/// Returns to user space.
pub unsafe fn usertrapret(mut p: CurrentProc<'static>) -> ! {
    // We're about to switch the destination of traps from kerneltrap() to
    // usertrap(), so turn off interrupts until we're back in user space,
    // where usertrap() is correct.
    unsafe { arch::intr_off() };

    // Send syscalls, interrupts, and exceptions to uservec in the
    // trampoline.
    unsafe { arch::w_stvec(TRAMPOLINE + arch::uservec_offset()) };

    let data = p.data();
    // SAFETY: the process's memory is installed before it first runs.
    let satp = unsafe { data.memory.assume_init_ref() }.satp();
    let kstack_top = data.kstack + PGSIZE;
    // SAFETY: the trap-frame page belongs to this process.
    let trap_frame = unsafe { &mut *data.trap_frame };

    // Set up the trapframe values that uservec will need when the process
    // next re-enters the kernel.
    trap_frame.kernel_satp = arch::r_satp(); // this process's kernel page table
    trap_frame.kernel_sp = kstack_top; // process's kernel stack
    trap_frame.kernel_trap = usertrap as usize;
    trap_frame.kernel_hartid = arch::cpu_id();

    // Set up the registers that the trampoline's sret will use to get to
    // user space.
    //
    // Set S Previous Privilege mode to User, and enable interrupts on the
    // way in.
    let mut sstatus = arch::r_sstatus();
    sstatus.remove(Sstatus::SPP);
    sstatus.insert(Sstatus::SPIE);
    unsafe { arch::w_sstatus(sstatus) };

    // Set S Exception Program Counter to the saved user pc.
    unsafe { arch::w_sepc(trap_frame.epc) };

    // Jump to userret in the trampoline at the top of memory, which
    // switches to the user page table, restores user registers, and
    // switches to user mode with sret.
    let userret = TRAMPOLINE + arch::userret_offset();
    // SAFETY: the trampoline is mapped at TRAMPOLINE in both the kernel
    // and the user page table.
    let userret: unsafe extern "C" fn(usize, usize) -> ! = unsafe { mem::transmute(userret) };
    unsafe { userret(TRAPFRAME, satp) }
}

/// Interrupts and exceptions from kernel code come here via kernelvec, on
/// whatever the current kernel stack is.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    // Nested traps are not expected, but a yield below may cause some;
    // save the trap registers so the interrupted code resumes exactly.
    let sepc = arch::r_sepc();
    let sstatus = arch::r_sstatus();

    assert!(
        sstatus.contains(Sstatus::SPP),
        "kerneltrap: not from supervisor mode"
    );
    assert!(!arch::intr_get(), "kerneltrap: interrupts enabled");

    match TrapKind::decode(arch::r_scause()) {
        TrapKind::Syscall => {
            // An ecall from supervisor mode has no meaning here.
            panic!("kerneltrap: syscall from kernel");
        }
        TrapKind::DeviceInterrupt => handle_device_interrupt(),
        TrapKind::TimerInterrupt => {
            acknowledge_timer();

            // Give up the CPU if a process is running.
            if let Some(p) = myproc() {
                let running = p.info().lock().state == Procstate::RUNNING;
                if running {
                    p.yield_cpu();
                }
            }
        }
        TrapKind::Unknown(scause) => {
            println!("scause {:#x}", scause);
            println!(
                "sepc={:#x} stval={:#x}",
                arch::r_sepc(),
                arch::r_stval()
            );
            panic!("kerneltrap");
        }
    }

    // The yield may have caused some traps to occur, so restore the trap
    // registers for use by kernelvec's sret instruction.
    unsafe {
        arch::w_sepc(sepc);
        arch::w_sstatus(sstatus);
    }
}

/// Claims the pending external interrupt from the PLIC, routes it to its
/// driver, and completes it.
fn handle_device_interrupt() {
    // irq indicates which device interrupted.
    let irq = plic::claim();

    if irq as usize == UART0_IRQ {
        kernel_builder().uart.intr();
    } else if irq as usize == VIRTIO0_IRQ {
        kernel_builder().disk_intr();
    } else if irq != 0 {
        println!("unexpected interrupt irq={}", irq);
    }

    // The PLIC allows each device to raise at most one interrupt at a
    // time; tell it the device is now allowed to interrupt again.
    if irq != 0 {
        plic::complete(irq);
    }
}

/// One machine-forwarded timer tick: CPU 0 advances the global clock, and
/// every hart acknowledges the software interrupt.
fn acknowledge_timer() {
    if arch::cpu_id() == 0 {
        clock_intr();
    }

    // Acknowledge the software interrupt by clearing the SSIP bit in sip.
    unsafe { arch::w_sip(arch::r_sip() & !2) };
}

fn clock_intr() {
    let mut ticks = kernel_builder().ticks.lock();
    *ticks = ticks.wrapping_add(1);
    ticks.wakeup();
}

/// Redirects the user pc into the alarm handler when the alarm is armed,
/// not already running its handler, and past its deadline. Returns whether
/// it fired.
fn alarm_fire(alarm: &mut Alarm, trap_frame: &mut TrapFrame, ticks: u32) -> bool {
    if alarm.interval == 0 || alarm.in_handler || ticks < alarm.deadline {
        return false;
    }
    // The handler must see the interrupted registers again on sigreturn.
    alarm.saved_trap_frame = *trap_frame;
    alarm.in_handler = true;
    alarm.deadline = ticks.wrapping_add(alarm.interval);
    trap_frame.epc = alarm.handler;
    true
}

/// Restores the registers stashed when the alarm fired; the inverse of
/// `alarm_fire`, called by sigreturn. Returns the restored a0 so the
/// syscall return value does not clobber it.
pub fn alarm_return(alarm: &mut Alarm, trap_frame: &mut TrapFrame) -> usize {
    *trap_frame = alarm.saved_trap_frame;
    alarm.in_handler = false;
    trap_frame.a0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scause_decoding() {
        assert_eq!(TrapKind::decode(8), TrapKind::Syscall);
        assert_eq!(
            TrapKind::decode(SCAUSE_INTERRUPT | 9),
            TrapKind::DeviceInterrupt
        );
        assert_eq!(
            TrapKind::decode(SCAUSE_INTERRUPT | 1),
            TrapKind::TimerInterrupt
        );
        // A load page fault is nobody's interrupt.
        assert_eq!(TrapKind::decode(13), TrapKind::Unknown(13));
        // The interrupt bit alone does not make a timer.
        assert_eq!(
            TrapKind::decode(SCAUSE_INTERRUPT | 5),
            TrapKind::Unknown(SCAUSE_INTERRUPT | 5)
        );
    }

    #[test]
    fn alarm_fires_at_its_deadline_and_not_before() {
        let mut alarm = Alarm {
            interval: 2,
            handler: 0x5000,
            deadline: 10,
            in_handler: false,
            saved_trap_frame: TrapFrame::zero(),
        };
        let mut tf = TrapFrame::zero();
        tf.epc = 0x1234;
        tf.a0 = 77;

        assert!(!alarm_fire(&mut alarm, &mut tf, 9));
        assert_eq!(tf.epc, 0x1234);

        assert!(alarm_fire(&mut alarm, &mut tf, 10));
        assert_eq!(tf.epc, 0x5000);
        assert_eq!(alarm.deadline, 12);
        assert!(alarm.in_handler);
        assert_eq!(alarm.saved_trap_frame.epc, 0x1234);

        // A tick inside the window must not re-enter the handler.
        assert!(!alarm_fire(&mut alarm, &mut tf, 12));

        // sigreturn restores the interrupted registers and re-arms.
        let a0 = alarm_return(&mut alarm, &mut tf);
        assert_eq!(a0, 77);
        assert_eq!(tf.epc, 0x1234);
        assert!(!alarm.in_handler);
        assert!(alarm_fire(&mut alarm, &mut tf, 12));
    }

    #[test]
    fn unarmed_alarm_never_fires() {
        let mut alarm = Alarm {
            interval: 0,
            handler: 0,
            deadline: 0,
            in_handler: false,
            saved_trap_frame: TrapFrame::zero(),
        };
        let mut tf = TrapFrame::zero();
        assert!(!alarm_fire(&mut alarm, &mut tf, u32::MAX));
        assert_eq!(tf.epc, 0);
    }
}
