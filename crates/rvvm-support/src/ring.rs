//! A fixed-capacity blocking ring buffer.
//!
//! Used for device-to-hart event queues (MSI posted writes, IPI doorbells):
//! a producer (a device callback, possibly running on another hart's thread
//! or the orchestrator's event-loop thread) pushes without blocking the
//! hart, and a consumer can block waiting for the next entry without
//! spinning. Storage is `crossbeam_queue::ArrayQueue`, a lock-free bounded
//! queue; the condvar below only arbitrates the blocking wait on an empty
//! pop, it never guards the queue itself.

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

/// A multi-producer, multi-consumer bounded queue with blocking pop.
pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    not_empty: Condvar,
    wake: Mutex<()>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            not_empty: Condvar::new(),
            wake: Mutex::new(()),
        }
    }

    /// Push a value. Returns the value back if the buffer is at capacity
    /// (the caller decides whether to drop the oldest entry or apply
    /// backpressure; this primitive never silently drops).
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let result = self.queue.push(value);
        if result.is_ok() {
            self.not_empty.notify_one();
        }
        result
    }

    /// Pop the oldest value without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Pop the oldest value, blocking until one is available.
    pub fn pop_blocking(&self) -> T {
        loop {
            if let Some(v) = self.queue.pop() {
                return v;
            }
            let mut guard = self.wake.lock();
            if self.queue.is_empty() {
                self.not_empty.wait(&mut guard);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
