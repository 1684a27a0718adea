//! Sleepable locks
use super::{Guard, Lock, RawLock, RawSpinlock};
use crate::proc::WaitChannel;

/// Mutual exclusion spin locks whose guards can sleep.
pub struct RawSleepablelock {
    lock: RawSpinlock,
    /// WaitChannel used to sleep/wakeup the lock's guards.
    waitchannel: WaitChannel,
}

/// Similar to `Spinlock`, but guards of this lock can sleep.
pub type Sleepablelock<T> = Lock<RawSleepablelock, T>;
/// Guards of `Sleepablelock<T>`. These guards can `sleep()`/`wakeup()`.
pub type SleepablelockGuard<'s, T> = Guard<'s, RawSleepablelock, T>;

impl RawSleepablelock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepablelock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    unsafe fn release(&self) {
        unsafe { self.lock.release() };
    }
}

impl<T> Sleepablelock<T> {
    /// Returns a new `Sleepablelock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleepablelock::new(name), data)
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically releases the lock and sleeps until `wakeup` is called on
    /// this lock's channel. Holds the lock again when it returns; callers
    /// recheck their condition in a loop.
    pub fn sleep(&mut self) {
        let channel = &self.raw_lock().waitchannel;
        channel.sleep(self);
    }

    /// Wakes up all processes sleeping on this lock's channel.
    pub fn wakeup(&self) {
        self.raw_lock().waitchannel.wakeup();
    }
}
