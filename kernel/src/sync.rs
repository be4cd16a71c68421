// kernel/src/sync.rs
//
// Single-core locking: a spinlock that also masks interrupts for as long as
// it is held, restoring the previous interrupt state on release.  Nothing
// else can run on the core while the guard lives, so critical sections
// must stay short and must never block.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::arch;

#[derive(Default)]
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

pub struct IrqLockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    saved: usize,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let saved = arch::irq_save();
        IrqLockGuard {
            guard: Some(self.inner.lock()),
            saved,
        }
    }

    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T>> {
        let saved = arch::irq_save();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqLockGuard { guard: Some(guard), saved }),
            None => {
                arch::irq_restore(saved);
                None
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the spinlock before interrupts come back on.
        drop(self.guard.take());
        arch::irq_restore(self.saved);
    }
}
