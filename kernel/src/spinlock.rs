//! Mutual exclusion spin locks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::proc::{cpuid, mycpu};
use crate::riscv::{intr_get, intr_off, intr_on};

/// A spin lock protecting the value inside it. `lock()` disables interrupts
/// on this CPU (via `push_off`) for as long as the guard lives, so lock
/// regions never race with interrupt handlers on the same hart.
pub struct SpinLock<T> {
    locked: AtomicBool,
    // Which cpu holds the lock, +1 (0 = unheld). For holding().
    cpu: AtomicUsize,
    // For debugging:
    name: &'static str,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            name,
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off(); // disable interrupts to avoid deadlock.

        #[cfg(target_arch = "riscv64")]
        if self.holding() {
            panic!("acquire {}", self.name);
        }

        // On RISC-V, the atomic swap turns into amoswap.w.aq; the Acquire
        // ordering keeps the critical section's loads and stores strictly
        // after the lock is taken.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        // Record info about lock acquisition for holding() and debugging.
        self.cpu.store(cpuid() + 1, Ordering::Relaxed);

        SpinLockGuard { lock: self }
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpuid() + 1
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Access the protected value without taking the lock. Only sound where
    /// some other invariant already guarantees exclusivity (a single hart
    /// with interrupts off, or a refcount proving sole ownership).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_unchecked(&self) -> &mut T {
        &mut *self.value.get()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard came from; used by `sleep` to reacquire after a
    /// wait-channel wakeup.
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    // Release the lock.
    fn drop(&mut self) {
        self.lock.cpu.store(0, Ordering::Relaxed);
        // The Release store keeps all critical-section writes visible
        // before the lock is observed free (a fence on RISC-V).
        self.lock.locked.store(false, Ordering::Release);
        pop_off();
    }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();

    intr_off();
    let c = mycpu();
    if c.noff.load(Ordering::Relaxed) == 0 {
        c.intena.store(old, Ordering::Relaxed);
    }
    c.noff.fetch_add(1, Ordering::Relaxed);
}

pub fn pop_off() {
    let c = mycpu();
    if intr_get() {
        panic!("pop_off - interruptible");
    }
    if c.noff.load(Ordering::Relaxed) < 1 {
        panic!("pop_off");
    }
    c.noff.fetch_sub(1, Ordering::Relaxed);
    if c.noff.load(Ordering::Relaxed) == 0 && c.intena.load(Ordering::Relaxed) {
        intr_on();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_value() {
        let lk = SpinLock::new("test", 0u32);
        {
            let mut g = lk.lock();
            *g += 41;
            *g += 1;
        }
        assert_eq!(*lk.lock(), 42);
    }

    #[test]
    fn nested_push_off_balances() {
        let a = SpinLock::new("a", ());
        let b = SpinLock::new("b", ());
        let ga = a.lock();
        let gb = b.lock();
        drop(gb);
        drop(ga);
        // A second acquire after full release must not deadlock.
        drop(a.lock());
    }
}
