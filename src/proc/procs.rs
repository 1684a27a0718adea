//! The process table, the scheduler, and process lifecycle.

use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};

use array_macro::array;

use crate::{
    addr::{PGSIZE, UVAddr},
    arch,
    kalloc::Kmem,
    kernel::kernel_builder,
    lock::Spinlock,
    memlayout::kstack,
    page::Page,
    param::{NPROC, MAXPROCNAME},
    proc::{
        Alarm, Context, CurrentProc, Pid, Proc, Procstate, TrapFrame, WaitChannel,
    },
    vm::{KernelMemory, UserMemory},
};

/// The first user program: a getpid call, then a quiet spin, all it can do
/// without a file system. od -t xI of the assembled image.
static INITCODE: [u8; 12] = [
    0x93, 0x08, 0xb0, 0x00, // li a7, 11  (getpid)
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0x00, 0x00, 0x00, // spin: j spin
];

pub struct Procs {
    pool: [Proc; NPROC],

    nextpid: AtomicI32,

    /// Guards parent pointers, and serializes wait() against exit(), so a
    /// parent cannot miss its child's dying wakeup.
    wait_lock: Spinlock<()>,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            pool: array![_ => Proc::new(); NPROC],
            nextpid: AtomicI32::new(1),
            wait_lock: Spinlock::new("wait_lock", ()),
        }
    }

    /// Looks in the process table for an UNUSED proc. If found, initializes
    /// the kernel-side state required to run in the kernel: the trap-frame
    /// page, the per-process kernel page table, and the kernel stack mapped
    /// into it. The user address space is the caller's to provide.
    fn alloc(&self, kmem: &Kmem) -> Option<&Proc> {
        for (i, p) in self.pool.iter().enumerate() {
            let mut info = p.info().lock();
            if info.state != Procstate::UNUSED {
                continue;
            }
            info.pid = self.nextpid.fetch_add(1, Ordering::Relaxed);
            info.state = Procstate::USED;
            drop(info);

            // The USED state claims the proc; its data is ours now.
            // SAFETY: see above.
            let data = unsafe { p.data_raw() };

            let trap_frame = match kmem.alloc() {
                Some(page) => page.into_usize() as *mut TrapFrame,
                None => {
                    self.free_proc(p, None, kmem);
                    return None;
                }
            };
            data.trap_frame = trap_frame;

            // This process's kernel page table, with its kernel stack
            // mapped beneath the trampoline.
            let mut kernel_map = KernelMemory::new_per_process(kmem);
            let kstack_page = match kmem.alloc() {
                Some(page) => page,
                None => {
                    kernel_map.free_per_process(0, kmem);
                    self.free_proc_keep_kmap(p, kmem);
                    return None;
                }
            };
            let kstack_va = kstack(i);
            let kstack_pa = kstack_page.addr();
            core::mem::forget(kstack_page); // now owned by the kernel map
            kernel_map.map_kstack(kstack_va, kstack_pa, kmem);
            data.kstack = kstack_va;
            data.kernel_map = MaybeUninit::new(kernel_map);

            // Set up the new context to start executing at forkret.
            data.context = Context::new();
            data.context.ra = forkret as usize;
            data.context.sp = kstack_va + PGSIZE;
            data.alarm = Alarm::new();

            return Some(p);
        }
        None
    }

    /// Returns a proc to the UNUSED state, releasing everything `alloc`
    /// and the caller built for it. `memory` is the user address space if
    /// one was installed. The wait lock must be held when called on a proc
    /// whose parent pointer is visible to others.
    fn free_proc(&self, p: &Proc, memory: Option<UserMemory>, kmem: &Kmem) {
        // SAFETY: the proc is ours: UNUSED->USED claimed by alloc, or a
        // ZOMBIE child being reaped.
        let data = unsafe { p.data_raw() };

        let user_size = memory.as_ref().map_or(0, |m| m.size());
        if let Some(memory) = memory {
            memory.free(kmem);
        }
        data.memory = MaybeUninit::uninit();

        if data.kstack != 0 {
            // SAFETY: alloc installed a kernel map whenever kstack is set.
            let mut kernel_map = unsafe { data.kernel_map.as_ptr().read() };
            kernel_map.unmap_kstack(data.kstack, kmem);
            kernel_map.free_per_process(user_size, kmem);
            data.kernel_map = MaybeUninit::uninit();
            data.kstack = 0;
        }

        self.free_proc_keep_kmap(p, kmem);
    }

    /// The tail of free_proc: everything but the kernel map and stack.
    fn free_proc_keep_kmap(&self, p: &Proc, kmem: &Kmem) {
        // SAFETY: as in free_proc.
        let data = unsafe { p.data_raw() };

        if !data.trap_frame.is_null() {
            // SAFETY: the trap-frame page was allocated by alloc.
            kmem.free(unsafe { Page::from_usize(data.trap_frame as usize) });
            data.trap_frame = ptr::null_mut();
        }
        data.name = [0; MAXPROCNAME];
        data.alarm = Alarm::new();
        p.reset_killed();
        // SAFETY: either the wait lock is held, or no other context has
        // ever seen this proc's parent pointer.
        unsafe { p.set_parent_raw(ptr::null()) };

        let mut info = p.info().lock();
        info.pid = 0;
        info.waitchannel = ptr::null();
        info.xstate = 0;
        info.state = Procstate::UNUSED;
    }

    /// Sets up the first user process.
    pub fn user_init(&self, kmem: &Kmem) {
        let p = self.alloc(kmem).expect("user_init");
        // SAFETY: alloc claimed the proc for us.
        let data = unsafe { p.data_raw() };

        // One user page holding initcode, plus the trampoline and the trap
        // frame.
        let mut memory = UserMemory::new(
            (data.trap_frame as usize).into(),
            Some(&INITCODE),
            kmem,
        )
        .expect("user_init: out of memory");
        // SAFETY: alloc installed the kernel map.
        unsafe { data.kernel_map.assume_init_mut() }.mirror_user(&mut memory, kmem);
        data.memory = MaybeUninit::new(memory);

        // SAFETY: the trap frame page belongs to this proc.
        let tf = unsafe { &mut *data.trap_frame };
        tf.epc = 0; // user program counter
        tf.sp = PGSIZE; // user stack pointer

        data.name[..8].copy_from_slice(b"initcode");
        p.info().lock().state = Procstate::RUNNABLE;
    }

    /// Creates a new process, copying the parent. Sets up the child's
    /// kernel stack to return as if from fork() with result 0.
    pub fn fork(&self, parent: &mut CurrentProc<'_>, kmem: &Kmem) -> Result<Pid, ()> {
        let np = self.alloc(kmem).ok_or(())?;
        // SAFETY: alloc claimed np for us.
        let ndata = unsafe { np.data_raw() };

        // Copy user memory from parent to child.
        let child_tf = (ndata.trap_frame as usize).into();
        let memory = unsafe { parent.data().memory.assume_init_mut() }
            .try_clone(child_tf, kmem);
        let mut memory = match memory {
            Some(memory) => memory,
            None => {
                self.free_proc(np, None, kmem);
                return Err(());
            }
        };
        // SAFETY: alloc installed the kernel map.
        unsafe { ndata.kernel_map.assume_init_mut() }.mirror_user(&mut memory, kmem);
        ndata.memory = MaybeUninit::new(memory);

        // Copy saved user registers; the child's fork returns 0.
        // SAFETY: both trap-frame pages belong to their procs.
        unsafe {
            *ndata.trap_frame = *parent.data().trap_frame;
            (*ndata.trap_frame).a0 = 0;
        }
        ndata.name = parent.data().name;

        let pid = np.info().lock().pid;

        {
            let _wait = self.wait_lock.lock();
            // SAFETY: the wait lock is held.
            unsafe { np.set_parent_raw(parent.raw()) };
        }

        np.info().lock().state = Procstate::RUNNABLE;
        Ok(pid)
    }

    /// Waits for a child to exit, reaps it, and returns its pid. Copies
    /// the exit status to `addr` unless it is None.
    pub fn wait(
        &self,
        current: &mut CurrentProc<'_>,
        addr: Option<UVAddr>,
        kmem: &Kmem,
    ) -> Result<Pid, ()> {
        let me = current.raw();
        let mut wait_guard = self.wait_lock.lock();
        loop {
            let mut havekids = false;
            for p in &self.pool {
                // SAFETY: the wait lock is held.
                if unsafe { p.parent_raw() } != me {
                    continue;
                }
                // A parent holds the wait lock while its child exits, so
                // the child cannot disappear under this scan.
                havekids = true;
                let info = p.info().lock();
                if info.state != Procstate::ZOMBIE {
                    continue;
                }
                let pid = info.pid;
                let xstate = info.xstate;
                drop(info);

                if let Some(addr) = addr {
                    // SAFETY: current is the running process.
                    let memory = unsafe { current.data().memory.assume_init_mut() };
                    if memory.copy_out(addr, &xstate).is_err() {
                        return Err(());
                    }
                }
                let memory = unsafe { p.data_raw().memory.as_ptr().read() };
                self.free_proc(p, Some(memory), kmem);
                return Ok(pid);
            }

            if !havekids || current.killed() {
                return Err(());
            }

            // Wait for a child to exit.
            current.child_waitchannel().sleep(&mut wait_guard);
        }
    }

    /// Exits the current process; does not return. An exited process stays
    /// a zombie until its parent calls wait().
    pub fn exit_current(&self, current: &mut CurrentProc<'_>, xstate: i32) -> ! {
        let me = current.raw();
        let initproc = &self.pool[0] as *const Proc;
        assert!(me != initproc, "init exiting");

        let wait_guard = self.wait_lock.lock();

        // Give any children to init.
        for p in &self.pool {
            // SAFETY: the wait lock is held.
            if unsafe { p.parent_raw() } == me {
                unsafe { p.set_parent_raw(initproc) };
                self.pool[0].child_waitchannel().wakeup();
            }
        }

        // The parent might be sleeping in wait().
        // SAFETY: the wait lock is held.
        let parent = unsafe { current.parent_raw() };
        if !parent.is_null() {
            // SAFETY: parents outlive their children in the static pool.
            unsafe { (*parent).child_waitchannel().wakeup() };
        }

        let mut info = current.info().lock();
        info.xstate = xstate;
        info.state = Procstate::ZOMBIE;
        drop(wait_guard);

        // Jump into the scheduler, never to return.
        // SAFETY: info is this process's guard and the state is ZOMBIE.
        unsafe { current.sched(&mut info) };
        panic!("zombie exit");
    }

    /// Kills the process with the given pid: it will exit at its next trip
    /// through the trap boundary.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        for p in &self.pool {
            let mut info = p.info().lock();
            if info.pid == pid && info.state != Procstate::UNUSED {
                p.kill();
                if info.state == Procstate::SLEEPING {
                    // Wake the process from sleep().
                    info.state = Procstate::RUNNABLE;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Wakes up every process sleeping on the channel.
    /// Must be called without any process's info lock held.
    pub fn wakeup_all(&self, channel: &WaitChannel) {
        let me = super::myproc().map_or(ptr::null(), |p| p.raw());
        for p in &self.pool {
            if p as *const Proc == me {
                continue;
            }
            let mut info = p.info().lock();
            if info.state == Procstate::SLEEPING
                && info.waitchannel == channel as *const WaitChannel
            {
                info.state = Procstate::RUNNABLE;
            }
        }
    }

    /// Prints a process listing to the console, for debugging (ctrl-P).
    /// Runs when something is wedged, so it takes no locks.
    pub fn dump(&self) {
        crate::println!();
        for p in &self.pool {
            // SAFETY: reads may be stale; this is best-effort diagnostics.
            let info = unsafe { &*p.info().get_mut_raw() };
            if info.state == Procstate::UNUSED {
                continue;
            }
            // SAFETY: as above.
            let name = unsafe { &p.data_raw().name };
            let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            crate::println!(
                "{} {:?} {}",
                info.pid,
                info.state,
                core::str::from_utf8(&name[..len]).unwrap_or("?")
            );
        }
    }

    /// Per-CPU process scheduler. Each CPU calls scheduler() after setting
    /// itself up, and never returns. It loops, picking a RUNNABLE process,
    /// switching to its kernel page table and context, and switching back
    /// when the process gives the CPU up.
    pub unsafe fn scheduler(&self) -> ! {
        let cpu = kernel_builder().cpus.current_raw();
        loop {
            // Avoid deadlock by ensuring that devices can interrupt.
            // SAFETY: not inside any critical section here.
            unsafe { arch::intr_on() };

            for p in self.pool.iter() {
                let mut info = p.info().lock();
                if info.state != Procstate::RUNNABLE {
                    continue;
                }

                // Switch to the chosen process. It is the process's job to
                // release its info lock and then reacquire it before
                // jumping back to us.
                info.state = Procstate::RUNNING;
                // SAFETY: interrupts are off (info lock held).
                unsafe { (*cpu).proc = p as *const Proc };
                // SAFETY: the RUNNABLE state means the proc is fully built.
                let data = unsafe { p.data_raw() };
                // Run on the process's own kernel page table, which maps
                // its kernel stack and mirrors its user addresses.
                unsafe { data.kernel_map.assume_init_ref().init_hart() };
                // SAFETY: data.context was set up by alloc/sched.
                unsafe { arch::context_switch(&mut (*cpu).context, &mut data.context) };
                // Back on the global kernel page table.
                unsafe { kernel_builder().kernel_memory().init_hart() };

                // The process is done running for now; it should have
                // changed its state before coming back.
                unsafe { (*cpu).proc = ptr::null() };
                drop(info);
            }
        }
    }
}

/// A fork child's very first scheduling by scheduler() will swtch to here.
unsafe extern "C" fn forkret() -> ! {
    let p = super::myproc().expect("forkret");
    // Still holding this process's info lock from the scheduler.
    // SAFETY: the lock was acquired by the scheduler on this hart.
    unsafe { p.info().force_unlock() };
    // SAFETY: the process was fully set up before it became RUNNABLE.
    unsafe { crate::trap::usertrapret(p) }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use super::*;
    use crate::addr::PGSIZE;

    fn kmem_with(pages: usize) -> Box<Kmem> {
        let layout = std::alloc::Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        // SAFETY: layout has a non-zero size.
        let base = unsafe { std::alloc::alloc(layout) } as usize;
        assert!(base != 0);
        let mut kmem = Box::new(Kmem::new());
        // SAFETY: the arena is fresh and handed to exactly this allocator.
        unsafe { kmem.init(base, base + pages * PGSIZE) };
        kmem
    }

    #[test]
    fn alloc_then_free_conserves_pages_and_state() {
        let kmem = kmem_with(192);
        let initial = kmem.free_pages();
        let procs = Box::new(Procs::new());

        let p = procs.alloc(&kmem).expect("a fresh table has room") as *const Proc;
        // SAFETY: just returned by alloc; the table outlives this test.
        let p = unsafe { &*p };
        {
            let info = p.info().lock();
            assert_eq!(info.state, Procstate::USED);
            assert!(info.pid >= 1);
        }
        // SAFETY: the proc was claimed by alloc and not yet published.
        assert!(!unsafe { p.data_raw() }.trap_frame.is_null());

        procs.free_proc(p, None, &kmem);
        assert_eq!(p.info().lock().state, Procstate::UNUSED);
        assert_eq!(kmem.free_pages(), initial);
    }

    #[test]
    fn kill_marks_the_process_and_wakes_sleepers() {
        let kmem = kmem_with(192);
        let procs = Box::new(Procs::new());

        let p = procs.alloc(&kmem).unwrap() as *const Proc;
        let p = unsafe { &*p };
        let pid = p.info().lock().pid;

        p.info().lock().state = Procstate::SLEEPING;
        assert_eq!(procs.kill(pid), Ok(()));
        assert!(p.killed());
        assert_eq!(p.info().lock().state, Procstate::RUNNABLE);

        assert_eq!(procs.kill(pid + 1234), Err(()));

        p.info().lock().state = Procstate::USED;
        procs.free_proc(p, None, &kmem);
    }
}
