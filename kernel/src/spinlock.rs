//! Spinlocks for short critical sections, and the `SpinMutex<T>`
//! wrapper the rest of the crate actually uses: a raw `Spinlock` plus
//! an RAII `SpinMutex<T>`/`MutexGuard` built over it, with
//! nested-lock and unlock-while-unheld assertions.

use crate::riscv;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
    name: &'static str,
    holder: AtomicI64,
}

impl Spinlock {
    pub const fn new(name: &'static str) -> Spinlock {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
            holder: AtomicI64::new(-1),
        }
    }

    pub fn acquire(&self) {
        riscv::push_off();
        let me = riscv::cpuid() as i64;
        assert!(!self.holding(), "nested lock: {} on cpu {me}", self.name);
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.holder.store(me, Ordering::Relaxed);
    }

    pub fn release(&self) {
        assert!(self.holding(), "unlocking unheld lock {}", self.name);
        self.holder.store(-1, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        riscv::pop_off();
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.holder.load(Ordering::Relaxed) == riscv::cpuid() as i64
    }
}

#[derive(Debug)]
pub struct SpinMutex<T: ?Sized> {
    lock: Spinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(name: &'static str, data: T) -> SpinMutex<T> {
        SpinMutex {
            lock: Spinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn acquire(&self) {
        self.lock.acquire();
    }

    pub fn release(&self) {
        self.lock.release();
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.acquire();
        MutexGuard { mutex: self }
    }

    pub fn lock_ref(&self) -> &Spinlock {
        &self.lock
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    pub fn with_lock<U, F: FnOnce(&mut T) -> U>(&self, thunk: F) -> U {
        let mut guard = self.lock();
        thunk(&mut guard)
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a SpinMutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

pub fn without_intrs<U, F: FnOnce() -> U>(thunk: F) -> U {
    riscv::push_off();
    let r = thunk();
    riscv::pop_off();
    r
}
