use cfg_if::cfg_if;

use crate::lock::{Guard, RawLock};

pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels could share an address, spuriously waking up
    /// more threads.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically releases the given lock and sleeps on this channel.
    /// Reacquires the lock when awakened; callers recheck their condition
    /// in a loop.
    pub fn sleep<R: RawLock, T>(&self, lock_guard: &mut Guard<'_, R, T>) {
        cfg_if! {
            if #[cfg(all(target_arch = "riscv64", not(test)))] {
                use core::ptr;

                use crate::proc::{myproc, Procstate};

                let p = myproc().expect("WaitChannel::sleep without a process");

                // Must acquire p's info lock in order to change its state
                // and then call sched. Once it is held, we are guaranteed
                // not to miss any wakeup (wakeup locks the same lock), so
                // it is okay to release the guarded lock.
                let mut info = p.info().lock();
                lock_guard.reacquire_after(move || {
                    // Go to sleep.
                    info.waitchannel = self as *const WaitChannel;
                    info.state = Procstate::SLEEPING;
                    // SAFETY: info is p's own guard and the state is no
                    // longer RUNNING.
                    unsafe { p.sched(&mut info) };

                    // Tidy up.
                    info.waitchannel = ptr::null();
                    drop(info);
                });
            } else {
                // Host threads stand in for harts: back off, let the waking
                // thread make progress, and let the caller recheck.
                lock_guard.reacquire_after(|| {
                    #[cfg(test)]
                    std::thread::yield_now();
                    #[cfg(not(test))]
                    core::hint::spin_loop();
                });
            }
        }
    }

    /// Wakes up all processes sleeping on this channel.
    /// Must be called without any process info lock held.
    pub fn wakeup(&self) {
        crate::kernel::kernel_builder().procs.wakeup_all(self);
    }
}
