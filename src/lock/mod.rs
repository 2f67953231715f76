//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and also includes traits that express their behaviors.
//!
//! Lock order (outermost first): mount/driver registry, filesystem context,
//! page-cache global lock, block-buffer bucket lock, page-cache entry lock,
//! process fd-table lock, process signal lock, scheduler run-queue lock.
//! A routine acquires in increasing order and releases in decreasing order.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleeplock;
mod spinlock;

pub use sleeplock::{RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{pop_off, push_off, LockStats, RawSpinlock, SpinLock, SpinLockGuard};

/// Raw locks that can be acquired and released.
pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current code path.
    unsafe fn release(&self);
}

/// Locks that own their own `RawLock` and `data: T`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes all access to `data`.
unsafe impl<R: RawLock + Send + Sync, T: Send> Sync for Lock<R, T> {}
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}

/// Guards that provide exclusive access to the inner data while held.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a raw pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur a race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Unlocks without a guard.
    ///
    /// # Safety
    ///
    /// Use only when the guard was leaked with `mem::forget`.
    pub unsafe fn unlock(&self) {
        unsafe { self.lock.release() };
    }

    pub fn raw(&self) -> &R {
        &self.lock
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires.
    ///
    /// The guard must not be used inside `f`; the data may change while
    /// unlocked.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        // SAFETY: this guard holds the lock, and it is reacquired before
        // the guard is used again.
        unsafe { self.lock.lock.release() };
        let result = f();
        self.lock.lock.acquire();
        result
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
        // SAFETY: the guard holds the lock and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        // SAFETY: the guard holds the lock.
        unsafe { self.lock.lock.release() };
    }
}
