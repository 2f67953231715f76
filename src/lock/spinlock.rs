//! Spin locks with interrupt save/restore.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use super::{Guard, Lock, RawLock};
use crate::hal;

/// Mutual exclusion lock that busy waits (spins) with local interrupts
/// disabled for the duration of the hold.
pub struct RawSpinlock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    locked: AtomicBool,

    /// Successful acquisitions.
    nacquire: AtomicU64,

    /// Acquisitions that found the lock held at least once.
    ncontend: AtomicU64,
}

/// Locks that busy wait (spin).
pub type SpinLock<T> = Lock<RawSpinlock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

/// Per-lock acquisition and contention counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct LockStats {
    pub acquisitions: u64,
    pub contentions: u64,
}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            nacquire: AtomicU64::new(0),
            ncontend: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.nacquire.load(Ordering::Relaxed),
            contentions: self.ncontend.load(Ordering::Relaxed),
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock, spinning until it is free.
    ///
    /// The `Acquire` exchange pairs with the `Release` store in
    /// `release()`, so stores from the previous critical section are
    /// visible in the next one.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with an IRQ handler that
        // takes the same lock. The flag state is restored on release.
        push_off();

        let mut contended = false;
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            contended = true;
            hal::cpu_relax();
        }

        let _ = self.nacquire.fetch_add(1, Ordering::Relaxed);
        if contended {
            let _ = self.ncontend.fetch_add(1, Ordering::Relaxed);
        }
    }

    unsafe fn release(&self) {
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSpinlock::new(name), data)
    }

    pub fn stats(&self) -> LockStats {
        self.raw().stats()
    }
}

/// Interrupt-disable depth of this CPU.
static NOFF: AtomicI32 = AtomicI32::new(0);

/// Were interrupts enabled before the outermost `push_off`?
static INTENA: AtomicBool = AtomicBool::new(false);

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = hal::intr_get();
    hal::intr_off();
    if NOFF.load(Ordering::Relaxed) == 0 {
        INTENA.store(old, Ordering::Relaxed);
    }
    let _ = NOFF.fetch_add(1, Ordering::Relaxed);
}

/// pop_off() should be paired with push_off().
pub fn pop_off() {
    let noff = NOFF.fetch_sub(1, Ordering::Relaxed);
    assert!(noff >= 1, "pop_off");
    if noff == 1 && INTENA.load(Ordering::Relaxed) {
        hal::intr_on();
    }
}
