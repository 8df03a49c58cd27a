//! Counting semaphores with explicit wait queues.
//!
//! A semaphore is the kernel's fundamental blocking primitive: `up` never
//! blocks, `down` blocks the caller (by swapping kthreads, see
//! [`crate::sync::kthread`]) whenever the signal count would go negative.
//! Condition variables ([`crate::sync::condvar`]) and page locks are both
//! layered on top of this.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use spin::Mutex;

use crate::sync::kthread::{self, Kthread};

struct SemInner {
    /// Remaining signals. Negative means `-signals` kthreads are parked on
    /// `waiters` waiting to be woken.
    signals: isize,
    waiters: VecDeque<(Box<Kthread>, u8)>,
}

/// A counting semaphore.
///
/// `new(n)` creates a semaphore with `n` available signals, so the first
/// `n` callers to `down()` proceed without blocking.
pub struct Semaphore {
    inner: Mutex<SemInner>,
}

impl Semaphore {
    pub const fn new(initial: isize) -> Self {
        Self {
            inner: Mutex::new(SemInner {
                signals: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Number of signals currently available. Negative means that many
    /// kthreads are parked waiting for an `up()`.
    pub fn count(&self) -> isize {
        self.inner.lock().signals
    }

    /// Decrement the signal count, blocking the caller if it would go
    /// negative.
    ///
    /// Matches the spec's `sem_down`: lock, decrement, and if the result
    /// went negative, swap onto a spare kthread's stack. The decrement and
    /// the waiter's enqueue must happen as a single critical section with
    /// respect to `up()` -- otherwise `up()` could see `signals < 0` with
    /// the waiter still missing from `waiters` and drop the wakeup. But the
    /// outgoing kthread's saved context is only valid once the architecture
    /// switch has actually run on the new stack (via `resume_trampoline`),
    /// so the enqueue can only physically happen post-switch.
    ///
    /// We reconcile the two by *not* releasing `self.inner`'s lock at the
    /// normal point: [`spin::MutexGuard::leak`] hands back the protected
    /// data without unlocking, so the lock stays held across the stack
    /// swap even though the `MutexGuard` value itself cannot travel there.
    /// `block_current`'s post-switch closure -- which runs after
    /// `switch_context` has already saved this kthread's context, so
    /// enqueuing it here is safe -- pushes the waiter and then releases the
    /// lock itself via [`Mutex::force_unlock`]. The stack swap in between
    /// performs nothing but the longjmp; the lock is never visibly released
    /// without the waiter already being on the queue.
    pub fn down(&self, target_cpu: u8) {
        let guard = self.inner.lock();
        let inner = spin::MutexGuard::leak(guard);
        inner.signals -= 1;
        if inner.signals < 0 {
            let spare = kthread::prepare_blocking_kthread();

            // Raw pointers aren't `Send`; smuggle the addresses through as
            // `usize`s instead so the closure below satisfies
            // `block_current`'s `Send` bound.
            let sem_addr = self as *const Semaphore as usize;
            let inner_addr = inner as *mut SemInner as usize;
            // SAFETY: semaphores back long-lived kernel objects (page
            // locks, cache locks, wait queues) that outlive any kthread
            // blocked on them, so both addresses recovered below remain
            // valid for as long as the parked kthread needs them. The lock
            // is still held (leaked above) and nothing else can observe
            // `*inner_addr` until this closure releases it.
            unsafe {
                kthread::block_current(spare, move |parked| {
                    let sem = &*(sem_addr as *const Semaphore);
                    let inner = &mut *(inner_addr as *mut SemInner);
                    inner.waiters.push_back((parked, target_cpu));
                    sem.inner.force_unlock();
                });
            }
            // Control reaches here again only once a matching `up()` has
            // resumed this kthread.
        } else {
            // SAFETY: this lock was taken (and leaked) at the top of this
            // call; nothing else has touched it since.
            unsafe {
                self.inner.force_unlock();
            }
        }
    }

    /// Increment the signal count, waking one waiter if the count had been
    /// negative.
    ///
    /// Matches the spec's `sem_up`: lock, increment, and if the previous
    /// value was negative, pop one waiter and hand it to
    /// [`kthread::kthread_runnable`] so its CPU resumes it on the next
    /// routine-message drain.
    ///
    /// Because `down()` now holds `self.inner`'s lock continuously from the
    /// decrement through the waiter's enqueue (see its comment), observing
    /// `signals <= 0` here under the same lock guarantees the matching
    /// waiter is already present -- no spin-wait needed.
    pub fn up(&self) {
        let woken = {
            let mut guard = self.inner.lock();
            guard.signals += 1;
            if guard.signals <= 0 {
                guard.waiters.pop_front()
            } else {
                None
            }
        };
        if let Some((waiter, cpu)) = woken {
            kthread::kthread_runnable(waiter, cpu);
        }
    }

    /// Non-blocking attempt: succeeds only if a signal is immediately
    /// available.
    pub fn try_down(&self) -> bool {
        let mut guard = self.inner.lock();
        if guard.signals > 0 {
            guard.signals -= 1;
            true
        } else {
            false
        }
    }
}

// SAFETY: all mutable state is behind `Mutex`.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn try_down_respects_count() {
        let sem = Semaphore::new(1);
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }

    #[test_case]
    fn up_restores_nonnegative_count() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.count(), 0);
        sem.up();
        assert_eq!(sem.count(), 1);
    }
}
