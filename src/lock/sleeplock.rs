//! Long-term locks for processes.
//!
//! Held across disk I/O and partial-page write framing; waiters give up
//! the CPU instead of spinning with interrupts off.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};
use crate::proc::scheduler;

pub struct RawSleepLock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    held: AtomicBool,
}

/// Locks that yield the scheduler instead of busy waiting.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            held: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        while self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            scheduler::yield_now();
        }
    }

    unsafe fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl RawSleepLock {
    /// Non-blocking acquire; true on success.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleepLock::new(name), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_serializes_access() {
        let lock = SleepLock::new("test", Vec::<u8>::new());
        lock.lock().push(1);
        lock.lock().push(2);
        assert_eq!(&*lock.lock(), &[1, 2]);
    }
}
