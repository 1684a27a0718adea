//! Sleeping locks
use super::{Guard, Lock, RawLock, Sleepablelock};
use crate::proc;

/// Long-term locks for processes. Holding one across disk I/O is fine:
/// contenders sleep instead of spinning.
pub struct RawSleeplock {
    /// Token identifying the holder. 0 means unlocked.
    locked: Sleepablelock<usize>,

    /// Name of lock for debugging.
    name: &'static str,
}

/// Locks that sleep instead of busy wait.
pub type Sleeplock<T> = Lock<RawSleeplock, T>;
/// Guards of `Sleeplock<T>`.
pub type SleeplockGuard<'s, T> = Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: Sleepablelock::new("sleep lock", 0),
            name,
        }
    }

    pub fn holding(&self) -> bool {
        let guard = self.locked.lock();
        *guard == proc::sleep_token()
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != 0 {
            guard.sleep();
        }
        *guard = proc::sleep_token();
    }

    unsafe fn release(&self) {
        let mut guard = self.locked.lock();
        assert!(*guard == proc::sleep_token(), "release {}", self.name);
        *guard = 0;
        guard.wakeup();
    }
}

impl<T> Sleeplock<T> {
    /// Returns a new `Sleeplock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleeplock::new(name), data)
    }
}
