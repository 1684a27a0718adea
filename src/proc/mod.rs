//! The process layer: per-process state, the current-process handle, and
//! the wait channels that sleep locks and the tick counter are built on.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};

use static_assertions::const_assert_eq;

use crate::{
    cpu,
    kernel::kernel_builder,
    lock::{Spinlock, SpinlockGuard},
    param::MAXPROCNAME,
    vm::{KernelMemory, UserMemory},
};

mod procs;
mod wait_channel;

pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;

/// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        // SAFETY: Context is plain integers; zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

// swtch.S stores the 14 registers at these offsets.
const_assert_eq!(core::mem::size_of::<Context>(), 112);

/// Per-process data for the trap handling code, kept in a page of its own
/// mapped at TRAPFRAME in the user page table. The trampoline reads and
/// writes these fields through fixed offsets, so the layout is part of the
/// assembly contract.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// kernel page table (satp of the process's kernel map)
    pub kernel_satp: usize, //   0
    /// top of process's kernel stack
    pub kernel_sp: usize, //   8
    /// usertrap()
    pub kernel_trap: usize, //  16
    /// saved user program counter
    pub epc: usize, //  24
    /// saved kernel tp
    pub kernel_hartid: usize, //  32
    pub ra: usize,  //  40
    pub sp: usize,  //  48
    pub gp: usize,  //  56
    pub tp: usize,  //  64
    pub t0: usize,  //  72
    pub t1: usize,  //  80
    pub t2: usize,  //  88
    pub s0: usize,  //  96
    pub s1: usize,  // 104
    pub a0: usize,  // 112
    pub a1: usize,  // 120
    pub a2: usize,  // 128
    pub a3: usize,  // 136
    pub a4: usize,  // 144
    pub a5: usize,  // 152
    pub a6: usize,  // 160
    pub a7: usize,  // 168
    pub s2: usize,  // 176
    pub s3: usize,  // 184
    pub s4: usize,  // 192
    pub s5: usize,  // 200
    pub s6: usize,  // 208
    pub s7: usize,  // 216
    pub s8: usize,  // 224
    pub s9: usize,  // 232
    pub s10: usize, // 240
    pub s11: usize, // 248
    pub t3: usize,  // 256
    pub t4: usize,  // 264
    pub t5: usize,  // 272
    pub t6: usize,  // 280
}

impl TrapFrame {
    pub const fn zero() -> Self {
        // SAFETY: TrapFrame is plain integers; zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

const_assert_eq!(core::mem::size_of::<TrapFrame>(), 288);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

/// Per-process alarm: a user handler called every `interval` ticks of CPU
/// time the process consumes.
pub struct Alarm {
    /// Alarm period in ticks; 0 means no alarm is set.
    pub interval: u32,

    /// User-space address of the handler.
    pub handler: usize,

    /// Tick count at which the alarm fires next.
    pub deadline: u32,

    /// Set while the handler runs, so the alarm cannot re-enter it.
    pub in_handler: bool,

    /// The interrupted user registers, restored by sigreturn.
    pub saved_trap_frame: TrapFrame,
}

impl Alarm {
    const fn new() -> Self {
        Self {
            interval: 0,
            handler: 0,
            deadline: 0,
            in_handler: false,
            saved_trap_frame: TrapFrame::zero(),
        }
    }
}

/// Fields protected by the process's info lock.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on this waitchannel.
    pub waitchannel: *const WaitChannel,

    /// Exit status to be returned to the parent's wait.
    pub xstate: i32,

    /// Process ID.
    pub pid: Pid,
}

/// Fields private to the running process, so its lock need not be held to
/// use them.
pub struct ProcData {
    /// Virtual address of the kernel stack, in the per-process kernel map.
    pub kstack: usize,

    /// The trap frame page, mapped at TRAPFRAME in the user page table.
    pub trap_frame: *mut TrapFrame,

    /// User address space.
    pub memory: MaybeUninit<UserMemory>,

    /// This process's kernel page table: the global map plus a mirror of
    /// the user's low addresses without the U bit.
    pub kernel_map: MaybeUninit<KernelMemory>,

    /// swtch() here to run the process.
    pub context: Context,

    /// The per-process alarm.
    pub alarm: Alarm,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            trap_frame: ptr::null_mut(),
            memory: MaybeUninit::uninit(),
            kernel_map: MaybeUninit::uninit(),
            context: Context::new(),
            alarm: Alarm::new(),
            name: [0; MAXPROCNAME],
        }
    }
}

pub struct Proc {
    info: Spinlock<ProcInfo>,

    /// Parent process. Guarded by the process table's wait lock, not this
    /// process's info lock.
    parent: UnsafeCell<*const Proc>,

    data: UnsafeCell<ProcData>,

    /// Set when the process should exit at the next trap boundary.
    killed: AtomicBool,

    /// The channel a parent sleeps on in wait().
    child_waitchannel: WaitChannel,
}

// SAFETY: info is lock-protected; parent is guarded by the wait lock; data
// is only touched by the process itself (or by its creator/reaper while the
// process cannot run).
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Self {
            info: Spinlock::new("proc", ProcInfo {
                state: Procstate::UNUSED,
                waitchannel: ptr::null(),
                xstate: 0,
                pid: 0,
            }),
            parent: UnsafeCell::new(ptr::null()),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
            child_waitchannel: WaitChannel::new(),
        }
    }

    pub fn info(&self) -> &Spinlock<ProcInfo> {
        &self.info
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(super) fn reset_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }

    pub fn child_waitchannel(&self) -> &WaitChannel {
        &self.child_waitchannel
    }

    /// The parent pointer.
    ///
    /// # Safety
    ///
    /// The process table's wait lock must be held.
    pub unsafe fn parent_raw(&self) -> *const Proc {
        unsafe { *self.parent.get() }
    }

    /// Sets the parent pointer.
    ///
    /// # Safety
    ///
    /// The process table's wait lock must be held, or the proc must not be
    /// visible to any other context yet.
    pub unsafe fn set_parent_raw(&self, parent: *const Proc) {
        unsafe { *self.parent.get() = parent };
    }

    /// The process's data, reachable from contexts that own the process:
    /// the process itself, or its creator/reaper while it cannot run.
    ///
    /// # Safety
    ///
    /// No other context may access the data concurrently.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_raw(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// Gives up the CPU for one scheduling round, returning with the info
    /// lock still held, exactly as it was given.
    ///
    /// # Safety
    ///
    /// `info` must be this process's own info guard, and the state must not
    /// be RUNNING.
    pub unsafe fn sched(&self, info: &mut SpinlockGuard<'_, ProcInfo>) {
        assert!(info.state != Procstate::RUNNING, "sched running");
        assert!(!crate::arch::intr_get(), "sched interruptible");

        let cpu = kernel_builder().cpus.current_raw();
        // SAFETY: interrupts are off; the cpu struct is ours.
        let intena = unsafe { (*cpu).interrupt_enabled };
        // SAFETY: the caller owns the process and its context; the
        // scheduler context was saved by scheduler() on this cpu.
        unsafe {
            crate::arch::context_switch(
                &mut self.data_raw().context,
                &mut (*cpu).context,
            );
        }
        // SAFETY: interrupts are still off.
        unsafe { (*cpu).interrupt_enabled = intena };
        let _ = info;
    }

    /// Gives up the CPU voluntarily or on a timer tick.
    pub fn yield_cpu(&self) {
        let mut info = self.info.lock();
        info.state = Procstate::RUNNABLE;
        // SAFETY: info is this process's guard and the state is RUNNABLE.
        unsafe { self.sched(&mut info) };
    }
}

/// A handle to the process currently running on this hart. Because the
/// process cannot be scheduled elsewhere while it runs here, the handle can
/// reach the process's private data without further locking.
pub struct CurrentProc<'p> {
    proc: &'p Proc,
}

impl<'p> CurrentProc<'p> {
    pub fn raw(&self) -> *const Proc {
        self.proc as *const Proc
    }

    pub fn pid(&self) -> Pid {
        self.info().lock().pid
    }

    pub fn data(&mut self) -> &mut ProcData {
        // SAFETY: the process is running on this hart, so only this context
        // touches its data.
        unsafe { self.proc.data_raw() }
    }
}

impl Deref for CurrentProc<'_> {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        self.proc
    }
}

/// The process running on this hart, if any.
pub fn myproc() -> Option<CurrentProc<'static>> {
    cpu::push_off();
    let cpu = kernel_builder().cpus.current_raw();
    // SAFETY: interrupts are off, so the cpu struct is stable.
    let proc = unsafe { (*cpu).proc };
    cpu::pop_off();
    let proc = NonNull::new(proc as *mut Proc)?;
    // SAFETY: the scheduler keeps the proc alive while it runs on this
    // hart; Proc values live in the static process table.
    Some(CurrentProc {
        proc: unsafe { &*proc.as_ptr() },
    })
}

/// An address identifying the current context for sleep lock ownership:
/// the current process when there is one, the hart otherwise (early boot
/// and host tests).
pub fn sleep_token() -> usize {
    match myproc() {
        Some(p) => p.raw() as usize,
        None => cpu::current_token() as usize,
    }
}
