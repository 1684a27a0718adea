//! Per-CPU state, and the matched interrupt disable/enable pairs the spin
//! locks are built on.

use core::cell::UnsafeCell;
use core::ptr;

use array_macro::array;
use cfg_if::cfg_if;

use crate::{param::NCPU, proc::Context, proc::Proc};

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *const Proc,

    /// swtch() here to enter scheduler().
    pub context: Context,

    /// Depth of push_off() nesting.
    pub noff: u32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

// The `Cpu` struct of the current cpu can be mutated. To do so, we need to
// obtain mutable pointers to the elements of `cpus` from a shared reference
// of a `Cpus`. It requires interior mutability, so we use `UnsafeCell`.
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

// SAFETY: each thread accesses only the cpu struct of the cpu on which it's
// running, and only with interrupts disabled.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    /// Return this CPU's cpu struct.
    ///
    /// It is safe to call this function with interrupts enabled, but the
    /// returned address may not be the current CPU's since the scheduler can
    /// move the process to another CPU on timer interrupt.
    pub fn current_raw(&self) -> *mut Cpu {
        let id = crate::arch::cpu_id();
        self.0[id].get()
    }
}

cfg_if! {
    if #[cfg(all(target_arch = "riscv64", not(test)))] {
        use crate::arch::{intr_get, intr_off, intr_on};
        use crate::kernel::kernel_builder;

        /// push_off/pop_off are like intr_off()/intr_on() except that they
        /// are matched: it takes two pop_off()s to undo two push_off()s.
        /// Also, if interrupts are initially off, then push_off, pop_off
        /// leaves them off.
        pub fn push_off() {
            let old = intr_get();
            // SAFETY: interrupts stay off until the matching pop_off().
            unsafe { intr_off() };

            let cpu = kernel_builder().cpus.current_raw();
            // SAFETY: interrupts are off, so this thread cannot migrate and
            // `cpu` is exclusively ours until pop_off().
            unsafe {
                if (*cpu).noff == 0 {
                    (*cpu).interrupt_enabled = old;
                }
                (*cpu).noff += 1;
            }
        }

        /// pop_off() should be paired with push_off().
        /// See push_off() for more details.
        pub fn pop_off() {
            assert!(!intr_get(), "pop_off: interruptible");

            let cpu = kernel_builder().cpus.current_raw();
            // SAFETY: interrupts are off.
            unsafe {
                assert!((*cpu).noff >= 1, "pop_off");
                (*cpu).noff -= 1;
                if (*cpu).noff == 0 && (*cpu).interrupt_enabled {
                    intr_on();
                }
            }
        }

        /// An address identifying the current execution context, recorded
        /// by spin locks as the holder.
        pub fn current_token() -> *mut () {
            kernel_builder().cpus.current_raw() as *mut ()
        }
    } else {
        pub fn push_off() {
            crate::arch::push_off();
        }

        pub fn pop_off() {
            crate::arch::pop_off();
        }

        pub fn current_token() -> *mut () {
            crate::arch::current_token()
        }
    }
}
