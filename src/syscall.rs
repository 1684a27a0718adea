//! System call dispatch and the process-level system calls.
//!
//! The contract with the trampoline: the number arrives in a7, arguments
//! in a0..a5, and the result is written back into the trapframe's a0
//! before user registers are restored.

use crate::{
    addr::UVAddr,
    kernel::kernel_builder,
    println,
    proc::{CurrentProc, Pid},
    trap,
};

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_SIGALARM: usize = 22;
pub const SYS_SIGRETURN: usize = 23;

/// The n-th system call argument register.
fn arg_raw(p: &mut CurrentProc<'_>, n: usize) -> usize {
    // SAFETY: the trap-frame page belongs to this process, and usertrap
    // leaves the argument registers untouched before dispatching here.
    let trap_frame = unsafe { &*p.data().trap_frame };
    match n {
        0 => trap_frame.a0,
        1 => trap_frame.a1,
        2 => trap_frame.a2,
        3 => trap_frame.a3,
        4 => trap_frame.a4,
        5 => trap_frame.a5,
        _ => panic!("arg_raw"),
    }
}

fn arg_int(p: &mut CurrentProc<'_>, n: usize) -> i32 {
    arg_raw(p, n) as i32
}

/// Dispatches the system call the process requested, writing the result
/// (or usize::MAX for failure) into its a0.
pub fn syscall(p: &mut CurrentProc<'_>) {
    // SAFETY: the trap-frame page belongs to this process.
    let num = unsafe { (*p.data().trap_frame).a7 };

    let result = match num {
        SYS_FORK => sys_fork(p),
        SYS_EXIT => sys_exit(p),
        SYS_WAIT => sys_wait(p),
        SYS_KILL => sys_kill(p),
        SYS_GETPID => sys_getpid(p),
        SYS_SBRK => sys_sbrk(p),
        SYS_SLEEP => sys_sleep(p),
        SYS_UPTIME => sys_uptime(p),
        SYS_SIGALARM => sys_sigalarm(p),
        SYS_SIGRETURN => sys_sigreturn(p),
        _ => {
            println!("{}: unknown sys call {}", p.pid(), num);
            Err(())
        }
    };

    let ret = result.unwrap_or(usize::MAX);
    // SAFETY: as above.
    unsafe { (*p.data().trap_frame).a0 = ret };
}

fn sys_fork(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let kernel = kernel_builder();
    kernel.procs.fork(p, &kernel.kmem).map(|pid| pid as usize)
}

fn sys_exit(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let status = arg_int(p, 0);
    kernel_builder().procs.exit_current(p, status)
}

fn sys_wait(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let addr = arg_raw(p, 0);
    let addr = if addr == 0 {
        None
    } else {
        Some(UVAddr::from(addr))
    };
    let kernel = kernel_builder();
    kernel
        .procs
        .wait(p, addr, &kernel.kmem)
        .map(|pid| pid as usize)
}

fn sys_kill(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid: Pid = arg_int(p, 0);
    kernel_builder().procs.kill(pid).map(|_| 0)
}

fn sys_getpid(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    Ok(p.pid() as usize)
}

/// Grows or shrinks the process's memory, keeping the mirror in its kernel
/// page table in step.
fn sys_sbrk(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let n = arg_int(p, 0) as isize;
    let kmem = &kernel_builder().kmem;

    let data = p.data();
    // SAFETY: memory and kernel_map are installed before the process runs.
    let memory = unsafe { data.memory.assume_init_mut() };
    let kernel_map = unsafe { data.kernel_map.assume_init_mut() };

    let oldsz = memory.size();
    let _ = memory.resize(n, kmem)?;
    let newsz = memory.size();

    if newsz > oldsz {
        kernel_map.mirror_grow(memory, oldsz, newsz, kmem);
    } else if newsz < oldsz {
        kernel_map.mirror_shrink(oldsz, newsz);
    }
    Ok(oldsz)
}

fn sys_sleep(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let n = arg_int(p, 0) as u32;
    let mut ticks = kernel_builder().ticks.lock();
    let start = *ticks;
    while ticks.wrapping_sub(start) < n {
        if p.killed() {
            return Err(());
        }
        ticks.sleep();
    }
    Ok(0)
}

fn sys_uptime(_p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    Ok(*kernel_builder().ticks.lock() as usize)
}

/// Arms (or with interval 0, disarms) the process's alarm: every
/// `interval` ticks, control diverts to `handler` until it sigreturns.
fn sys_sigalarm(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let interval = arg_int(p, 0);
    if interval < 0 {
        return Err(());
    }
    let interval = interval as u32;
    let handler = arg_raw(p, 1);

    let now = *kernel_builder().ticks.lock();
    let alarm = &mut p.data().alarm;
    alarm.interval = interval;
    alarm.handler = handler;
    alarm.deadline = now.wrapping_add(interval);
    alarm.in_handler = false;
    Ok(0)
}

/// Returns from an alarm handler to the interrupted user code.
fn sys_sigreturn(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let data = p.data();
    // SAFETY: the trap-frame page belongs to this process.
    let trap_frame = unsafe { &mut *data.trap_frame };
    Ok(trap::alarm_return(&mut data.alarm, trap_frame))
}
