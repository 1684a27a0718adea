//! A stand-in back end for non-RISC-V targets.
//!
//! Nothing here talks to hardware. Each host thread acts as a hart: it gets
//! a hart id and its own interrupt-enable flag and push_off depth, which is
//! what the lock layer needs to run unmodified in unit tests.

use cfg_if::cfg_if;

use crate::arch::Sstatus;
use crate::proc::Context;

cfg_if! {
    if #[cfg(test)] {
        use core::cell::Cell;
        use core::sync::atomic::{AtomicUsize, Ordering};

        use crate::param::NCPU;

        static NEXT_HART: AtomicUsize = AtomicUsize::new(0);

        std::thread_local! {
            static HART: Cell<Option<usize>> = Cell::new(None);
            static INTR_ENABLED: Cell<bool> = Cell::new(true);
            static NOFF: Cell<u32> = Cell::new(0);
            static SAVED_INTR: Cell<bool> = Cell::new(false);
            static TOKEN: u8 = 0;
        }

        pub fn cpu_id() -> usize {
            HART.with(|h| match h.get() {
                Some(id) => id,
                None => {
                    let id = NEXT_HART.fetch_add(1, Ordering::Relaxed) % NCPU;
                    h.set(Some(id));
                    id
                }
            })
        }

        pub fn intr_get() -> bool {
            INTR_ENABLED.with(|i| i.get())
        }

        pub unsafe fn intr_on() {
            INTR_ENABLED.with(|i| i.set(true));
        }

        pub unsafe fn intr_off() {
            INTR_ENABLED.with(|i| i.set(false));
        }

        pub fn push_off() {
            let old = intr_get();
            unsafe { intr_off() };
            NOFF.with(|n| {
                if n.get() == 0 {
                    SAVED_INTR.with(|s| s.set(old));
                }
                n.set(n.get() + 1);
            });
        }

        pub fn pop_off() {
            assert!(!intr_get(), "pop_off: interruptible");
            NOFF.with(|n| {
                assert!(n.get() >= 1, "pop_off");
                n.set(n.get() - 1);
                if n.get() == 0 && SAVED_INTR.with(|s| s.get()) {
                    unsafe { intr_on() };
                }
            });
        }

        /// A per-thread address, standing in for the `Cpu` pointer that
        /// identifies a lock holder on the real machine.
        pub fn current_token() -> *mut () {
            TOKEN.with(|t| t as *const u8 as *mut ())
        }
    } else {
        use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

        // A single implicit hart; nothing on a hosted non-test build ever
        // runs this code, it only has to compile and keep the invariants.
        static INTR_ENABLED: AtomicBool = AtomicBool::new(true);
        static NOFF: AtomicU32 = AtomicU32::new(0);
        static SAVED_INTR: AtomicBool = AtomicBool::new(false);
        static TOKEN: u8 = 0;

        pub fn cpu_id() -> usize {
            0
        }

        pub fn intr_get() -> bool {
            INTR_ENABLED.load(Ordering::Relaxed)
        }

        pub unsafe fn intr_on() {
            INTR_ENABLED.store(true, Ordering::Relaxed);
        }

        pub unsafe fn intr_off() {
            INTR_ENABLED.store(false, Ordering::Relaxed);
        }

        pub fn push_off() {
            let old = intr_get();
            unsafe { intr_off() };
            if NOFF.load(Ordering::Relaxed) == 0 {
                SAVED_INTR.store(old, Ordering::Relaxed);
            }
            let _ = NOFF.fetch_add(1, Ordering::Relaxed);
        }

        pub fn pop_off() {
            assert!(!intr_get(), "pop_off: interruptible");
            assert!(NOFF.load(Ordering::Relaxed) >= 1, "pop_off");
            if NOFF.fetch_sub(1, Ordering::Relaxed) == 1 && SAVED_INTR.load(Ordering::Relaxed) {
                unsafe { intr_on() };
            }
        }

        pub fn current_token() -> *mut () {
            &TOKEN as *const u8 as *mut ()
        }
    }
}

// CSR stand-ins. Trap entry and exit never run on a hosted target; these
// exist so the trap and boot paths type-check everywhere.

pub fn r_sstatus() -> Sstatus {
    Sstatus::empty()
}

pub unsafe fn w_sstatus(_x: Sstatus) {}

pub fn r_sip() -> usize {
    0
}

pub unsafe fn w_sip(_x: usize) {}

pub unsafe fn w_sepc(_x: usize) {}

pub fn r_sepc() -> usize {
    0
}

pub fn r_scause() -> usize {
    0
}

pub fn r_stval() -> usize {
    0
}

pub fn r_satp() -> usize {
    0
}

pub unsafe fn w_satp(_x: usize) {}

pub unsafe fn w_stvec(_x: usize) {}

pub unsafe fn sfence_vma() {}

pub unsafe fn write_kernel_vector() {}

pub unsafe fn context_switch(_old: *mut Context, _new: *mut Context) {
    panic!("context_switch: hosted target has no scheduler");
}

use crate::memlayout::KERNBASE;

#[repr(align(4096))]
struct FakeImage([u8; 4096]);

static TRAMPOLINE_IMAGE: FakeImage = FakeImage([0; 4096]);

pub fn trampoline_addr() -> usize {
    TRAMPOLINE_IMAGE.0.as_ptr() as usize
}

pub fn uservec_offset() -> usize {
    0
}

pub fn userret_offset() -> usize {
    0
}

// A pretend kernel image: one megabyte of text, another of data. These are
// only ever compared against the KERNBASE..PHYSTOP window when building
// kernel page tables, never dereferenced.

pub fn text_end() -> usize {
    KERNBASE + 0x10_0000
}

pub fn kernel_end() -> usize {
    KERNBASE + 0x20_0000
}
