//! Writer-preferring spin RwLock.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

pub struct RwLock<T: Send> {
    rcnt: AtomicUsize,
    wcnt: AtomicUsize,
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send> Sync for RwLock<T> {}

impl<T: Send> RwLock<T> {
    pub const fn new(v: T) -> Self {
        Self {
            rcnt: AtomicUsize::new(0),
            wcnt: AtomicUsize::new(0),
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(v),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            while self.wcnt.load(Ordering::Relaxed) > 0 {
                core::hint::spin_loop();
            }

            self.rcnt.fetch_add(1, Ordering::Acquire);
            if self.wcnt.load(Ordering::Relaxed) == 0 {
                break;
            }
            self.rcnt.fetch_sub(1, Ordering::Relaxed);
        }

        RwLockReadGuard { rwlock: self }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.wcnt.fetch_add(1, Ordering::Relaxed);

        while self.rcnt.load(Ordering::Relaxed) > 0 {
            core::hint::spin_loop();
        }

        loop {
            while self.lock.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        RwLockWriteGuard { rwlock: self }
    }

    /// Non-blocking read acquisition, for contexts that must not spin
    /// behind a writer (e.g. interrupt handlers racing a teardown).
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.wcnt.load(Ordering::Relaxed) > 0 {
            return None;
        }

        self.rcnt.fetch_add(1, Ordering::Acquire);
        if self.wcnt.load(Ordering::Relaxed) == 0 {
            Some(RwLockReadGuard { rwlock: self })
        } else {
            self.rcnt.fetch_sub(1, Ordering::Relaxed);
            None
        }
    }

    /// Non-blocking write acquisition, for paths that must not wait behind
    /// a lock holder (e.g. bounded-retry configuration changes).
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.wcnt.fetch_add(1, Ordering::Relaxed);

        if self.rcnt.load(Ordering::Relaxed) > 0 {
            self.wcnt.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RwLockWriteGuard { rwlock: self })
        } else {
            self.wcnt.fetch_sub(1, Ordering::Relaxed);
            None
        }
    }
}

pub struct RwLockReadGuard<'a, T: Send> {
    rwlock: &'a RwLock<T>,
}

impl<T: Send> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.rwlock.rcnt.fetch_sub(1, Ordering::Release);
    }
}

impl<T: Send> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.rwlock.data.get() }
    }
}

pub struct RwLockWriteGuard<'a, T: Send> {
    rwlock: &'a RwLock<T>,
}

impl<T: Send> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.rwlock.lock.store(false, Ordering::Release);
        self.rwlock.wcnt.fetch_sub(1, Ordering::Release);
    }
}

impl<T: Send> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.rwlock.data.get() }
    }
}

impl<T: Send> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.rwlock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_write() {
        let lock = RwLock::new(7);

        {
            let r1 = lock.read();
            let r2 = lock.read();
            assert_eq!(*r1, 7);
            assert_eq!(*r2, 7);
            assert!(lock.try_write().is_none());
        }

        {
            let mut w = lock.write();
            *w = 8;
        }

        assert_eq!(*lock.read(), 8);
    }

    #[test]
    fn test_try_write() {
        let lock = RwLock::new(0);

        let w = lock.try_write().unwrap();
        assert!(lock.try_write().is_none());
        drop(w);
        assert!(lock.try_write().is_some());
    }
}
