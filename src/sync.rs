//! Small synchronization primitives used by the scheduler: a counting
//! semaphore (for [`TaskContext::busy_wait`](crate::task_context::TaskContext::busy_wait)
//! completion signals) and a wake-token pool (for the sleeping-worker park
//! / release protocol in the worker loop).
//!
//! Both are built on `std::sync::{Mutex, Condvar}`, mirroring the
//! `Mutex`-guarded-inner-state pattern the teacher's `ProcessControlBlock`
//! uses for its own shared mutable state.

use std::sync::{Condvar, Mutex};

/// A counting semaphore.
///
/// `release` increments the count and wakes one waiter; `acquire` blocks
/// until the count is positive then decrements it; `try_acquire` never
/// blocks.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Increment the count by one and wake a single waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Increment the count by `n` and wake up to `n` waiters.
    pub fn release_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.condvar.notify_all();
    }

    /// Block until the count is positive, then decrement it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Decrement the count without blocking if it is already positive.
    /// Returns `true` if a token was acquired.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Current token count (diagnostic only; may be stale the instant it
    /// is observed under concurrent access).
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }
}
