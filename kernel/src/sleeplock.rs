//! Long-term locks for processes. A process that cannot get a sleep lock
//! yields the CPU via sleep/wakeup instead of spinning, so sleep locks may
//! be held across disk I/O. Only processes (never interrupt handlers) may
//! take one.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::proc::{self, sleep, wakeup};
use crate::spinlock::SpinLock;

struct SleepInner {
    locked: bool,
    pid: i32, // process holding lock
}

pub struct SleepLock<T> {
    lk: SpinLock<SleepInner>, // spinlock protecting this sleep lock
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, value: T) -> SleepLock<T> {
        SleepLock {
            lk: SpinLock::new(name, SleepInner { locked: false, pid: 0 }),
            value: UnsafeCell::new(value),
        }
    }

    fn chan(&self) -> usize {
        self as *const SleepLock<T> as *const u8 as usize
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut inner = self.lk.lock();
        while inner.locked {
            inner = sleep(self.chan(), inner);
        }
        inner.locked = true;
        inner.pid = proc::mypid().unwrap_or(0);
        drop(inner);

        SleepLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        let inner = self.lk.lock();
        inner.locked && inner.pid == proc::mypid().unwrap_or(0)
    }

    /// See `SpinLock::get_unchecked`: sound only when the caller can prove
    /// sole ownership (e.g. an inode with refcnt 1).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_unchecked(&self) -> &mut T {
        &mut *self.value.get()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut inner = self.lock.lk.lock();
        inner.locked = false;
        inner.pid = 0;
        wakeup(self.lock.chan());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let lk = SleepLock::new("test", [0u8; 8]);
        {
            let mut g = lk.lock();
            g[0] = 7;
        }
        assert!(!lk.holding());
        assert_eq!(lk.lock()[0], 7);
    }
}
