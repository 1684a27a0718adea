//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and traits that express their behaviors.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Raw locks that own no data.
pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current context.
    unsafe fn release(&self);
}

/// A lock that owns its own `RawLock` and `data: T`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: `&Lock` only hands out `&T` through a guard, which holds the lock.
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub(super) const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a raw pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a mutable reference to the lock, so nobody else
        // can be inside a critical section.
        unsafe { &mut *self.data.get() }
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// The lock must be held by this context, with its guard forgotten or
    /// left on another stack, as happens across a context switch into a
    /// new process.
    pub unsafe fn force_unlock(&self) {
        unsafe { self.lock.release() }
    }
}

/// Guards that prove a lock is held; dropping one releases the lock.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    // A guard must not be sent to another thread: the release must happen
    // in the acquiring context.
    _marker: PhantomData<*const ()>,
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    /// The raw lock, at the lifetime of the lock itself rather than of this
    /// borrow, so that a sleeping guard can be handed to its wait channel.
    pub(super) fn raw_lock(&self) -> &'s R {
        &self.lock.lock
    }

    /// Releases the lock, runs `f`, and acquires the lock again.
    /// Useful for sleeping while temporarily giving the lock up.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        // SAFETY: the guard proves the lock is held; it is reacquired below
        // before the guard can be used again.
        unsafe { self.lock.lock.release() };
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        // SAFETY: the existence of the guard proves the lock is held.
        unsafe { self.lock.lock.release() };
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}
