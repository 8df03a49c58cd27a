//! Condition variables layered on top of counting semaphores.
//!
//! A CV is a semaphore plus an explicit waiter count. The count exists
//! because a waiter may have announced its intent to sleep (incrementing
//! the count) before it has actually gone down on the semaphore; without
//! tracking that gap, `signal`/`broadcast` could wake a waiter that never
//! makes it to sleep, losing the wakeup.

use core::sync::atomic::{AtomicIsize, Ordering};

use crate::sync::sem::Semaphore;

/// A condition variable.
pub struct CondVar {
    sem: Semaphore,
    /// Number of kthreads that have committed to waiting (incremented
    /// before `down`) but may not yet be parked.
    nr_waiters: AtomicIsize,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(0),
            nr_waiters: AtomicIsize::new(0),
        }
    }

    /// Block the caller until a matching `signal`/`broadcast`.
    ///
    /// Increments `nr_waiters` before blocking so a concurrent `signal`
    /// spinning for "every promised waiter is actually asleep" can account
    /// for this caller even before it reaches the semaphore.
    pub fn wait(&self, target_cpu: u8) {
        self.begin_wait();
        self.commit_wait(target_cpu);
    }

    /// Announce intent to wait without blocking yet.
    ///
    /// Splitting `wait` in two lets a caller re-check the condition it is
    /// about to block on *after* announcing intent but *before* actually
    /// blocking: checking the condition first and only then calling `wait`
    /// leaves a gap where a signaler can set the condition and broadcast
    /// between the check and the announcement, see nobody waiting yet
    /// (`nr_waiters == -sem.count()` trivially holds at `0 == 0`), and wake
    /// no one -- after which this caller blocks with no future wakeup
    /// coming. Pair with [`Self::commit_wait`] if the condition still
    /// doesn't hold, or [`Self::cancel_wait`] if it now does.
    pub fn begin_wait(&self) {
        self.nr_waiters.fetch_add(1, Ordering::SeqCst);
    }

    /// Block, having already announced intent via [`Self::begin_wait`].
    pub fn commit_wait(&self, target_cpu: u8) {
        self.sem.down(target_cpu);
    }

    /// Cancel a [`Self::begin_wait`] that turned out to be unnecessary
    /// because the awaited condition already held.
    pub fn cancel_wait(&self) {
        self.nr_waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake exactly one waiter, once every promised waiter has actually
    /// gone to sleep on the semaphore (`nr_waiters == -sem.signals`).
    /// Spinning here is intentional and bounded: the gap between
    /// announcing intent to wait and actually blocking is a few
    /// instructions on another core.
    pub fn signal(&self) {
        while self.nr_waiters.load(Ordering::SeqCst) != -self.sem.count() {
            core::hint::spin_loop();
        }
        if self.nr_waiters.fetch_sub(1, Ordering::SeqCst) > 0 {
            self.sem.up();
        } else {
            // No one was actually waiting; undo the decrement.
            self.nr_waiters.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Wake every current waiter, same quiescence wait as `signal`.
    pub fn broadcast(&self) {
        while self.nr_waiters.load(Ordering::SeqCst) != -self.sem.count() {
            core::hint::spin_loop();
        }
        let n = self.nr_waiters.swap(0, Ordering::SeqCst);
        for _ in 0..n.max(0) {
            self.sem.up();
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn signal_without_waiters_is_noop() {
        let cv = CondVar::new();
        cv.signal();
        assert_eq!(cv.sem.count(), 0);
    }

    #[test_case]
    fn broadcast_without_waiters_is_noop() {
        let cv = CondVar::new();
        cv.broadcast();
        assert_eq!(cv.sem.count(), 0);
    }
}
