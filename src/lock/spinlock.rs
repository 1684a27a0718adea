//! Spin locks
use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::cpu::{current_token, pop_off, push_off};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock for debugging.
    name: &'static str,

    /// If the lock is held, contains an address identifying the holder
    /// (the `Cpu` of the holding hart). Otherwise, contains null.
    locked: AtomicPtr<()>,
}

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Check whether this context is holding the lock.
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == current_token()
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// All stores done in one critical section are visible in the next
    /// critical section's loads: the exchange uses `Acquire` ordering and is
    /// paired with the `Release` store in `release()`, which forbids moving
    /// loads and stores across the lock boundaries.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock.
        push_off();
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                current_token(),
                Ordering::Acquire,
                // Okay to use `Relaxed` ordering since we don't enter the
                // critical section anyway if the exchange fails.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    unsafe fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        pop_off();
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSpinlock::new(name), data)
    }
}
