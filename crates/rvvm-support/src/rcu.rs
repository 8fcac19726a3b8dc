//! Reader-side RCU wrapper around `crossbeam-epoch`.
//!
//! The physical memory map is read on every guest memory access and written
//! only when the machine attaches or removes a region (always with every
//! hart paused, per the machine's concurrency contract). Readers must never
//! block behind a writer. This wraps `crossbeam_epoch::Atomic<T>` so callers
//! work with a small, domain-named API (`load`, `publish`) instead of the
//! general-purpose epoch API, and so the pin/guard discipline lives in one
//! place.
//!
//! The writer-side reclamation algorithm itself — deciding when it is safe
//! to free a retired table — is `crossbeam-epoch`'s; this module is the
//! reader-side glue the rest of the workspace is meant to consume.

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::sync::atomic::Ordering;

/// A single-writer, many-reader cell publishing immutable snapshots of `T`.
pub struct Rcu<T> {
    current: Atomic<T>,
}

impl<T> Rcu<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: Atomic::new(value),
        }
    }

    /// Pin the local epoch and run `f` with a reference to the current
    /// snapshot. The reference is valid for the whole call even if a writer
    /// concurrently publishes and retires a new snapshot: retirement is
    /// deferred until every guard pinned before the swap has been dropped.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        // SAFETY: `shared` was just loaded under `guard`'s epoch pin, so the
        // pointee cannot be reclaimed before `guard` (and therefore this
        // reference) is dropped.
        let value = unsafe { shared.deref() };
        f(value)
    }

    /// Publish a new snapshot, retiring the old one for deferred reclamation.
    /// Must be called with external mutual exclusion between writers (the
    /// machine's pause guarantee, or a mutex around this cell).
    pub fn publish(&self, value: T) {
        let guard = epoch::pin();
        let new = Owned::new(value).into_shared(&guard);
        let old = self.current.swap(new, Ordering::AcqRel, &guard);
        if !old.is_null() {
            // SAFETY: `old` was published by a previous call to `publish`
            // and is now unreachable from `self.current`; any reader that
            // observed it did so under a guard that defers this drop.
            unsafe { guard.defer_destroy(old) };
        }
    }
}

impl<T> Drop for Rcu<T> {
    fn drop(&mut self) {
        let guard = epoch::pin();
        let shared = self
            .current
            .swap(crossbeam_epoch::Shared::null(), Ordering::AcqRel, &guard);
        if !shared.is_null() {
            unsafe { guard.defer_destroy(shared) };
        }
    }
}
