//! MCS queue lock.
//!
//! Waiters spin on a flag in their own `MCSNode` rather than on the lock
//! word, so contended acquisition does not ping-pong a shared cache line.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

pub struct MCSNode<T> {
    next: AtomicPtr<MCSNode<T>>,
    locked: AtomicBool,
    _phantom: PhantomData<T>,
}

impl<T> MCSNode<T> {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(null_mut()),
            locked: AtomicBool::new(false),
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for MCSNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MCSLock<T> {
    last: AtomicPtr<MCSNode<T>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for MCSLock<T> {}
unsafe impl<T: Send> Sync for MCSLock<T> {}

impl<T> MCSLock<T> {
    pub const fn new(v: T) -> Self {
        Self {
            last: AtomicPtr::new(null_mut()),
            data: UnsafeCell::new(v),
        }
    }

    pub fn lock<'a>(&'a self, node: &'a mut MCSNode<T>) -> MCSLockGuard<'a, T> {
        node.next.store(null_mut(), Ordering::Relaxed);

        let node_ptr = node as *mut MCSNode<T>;
        let prev = self.last.swap(node_ptr, Ordering::AcqRel);

        if !prev.is_null() {
            // The locked flag must be raised before the predecessor can see
            // this node, or its unlock may be lost.
            node.locked.store(true, Ordering::Relaxed);

            unsafe { (*prev).next.store(node_ptr, Ordering::Release) };

            while node.locked.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }

        MCSLockGuard { lock: self, node }
    }
}

pub struct MCSLockGuard<'a, T> {
    lock: &'a MCSLock<T>,
    node: &'a mut MCSNode<T>,
}

impl<T> Drop for MCSLockGuard<'_, T> {
    fn drop(&mut self) {
        let node_ptr = self.node as *mut MCSNode<T>;

        if self.node.next.load(Ordering::Relaxed).is_null() {
            if self
                .lock
                .last
                .compare_exchange(node_ptr, null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            // A successor has swapped itself in but has not linked yet.
            while self.node.next.load(Ordering::Relaxed).is_null() {
                core::hint::spin_loop();
            }
        }

        let next = self.node.next.load(Ordering::Acquire);
        unsafe { (*next).locked.store(false, Ordering::Release) };
    }
}

impl<T> Deref for MCSLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MCSLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
