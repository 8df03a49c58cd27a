//! Uthread blocking on N event queues (§4.6's `uth_blockon_evqs`).
//!
//! The full protocol: fast poll, build one wait link per event queue,
//! re-poll under the clear-`check_evqs`-then-poll loop, and finally hand
//! control back to the 2LS with a callback that atomically marks the
//! uthread blocked only after it has already rechecked `check_evqs` --
//! closing the race where a wakeup arrives in the gap between "decided to
//! sleep" and "is actually marked asleep".
//!
//! This crate implements the event-queue side of that protocol exactly as
//! spec.md describes it. The underlying uthread context switch itself
//! (parking the uthread's execution state and resuming the vcore's 2LS
//! loop) is parlib/2LS machinery with no counterpart in this crate or the
//! teacher repo, so `uth_blockon_evqs` takes the actual yield as a
//! caller-supplied closure -- the same shape `kernel::sync::kthread`'s
//! `block_current` uses for its own "hand the parked thread to whoever
//! resumes it" step, for the same reason (the generic swap mechanism is
//! out of this core's scope; the *race* around it is what is being
//! modeled).

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::handler::EventQueue;
use super::mbox::EventMsg;

/// Wait-free single-runner-with-rerun gate, reimplemented locally from
/// `kernel::sched::ksched::PokeTracker`'s algorithm (CAS a `running` flag;
/// a concurrent poker that loses the race just sets `run_again` and
/// returns; the runner loops while `run_again` is set). Cannot depend on
/// the kernel crate across the user/kernel boundary, so the same small
/// algorithm is ported rather than shared -- see `DESIGN.md`'s C6 entry.
struct WakeupPoke {
    running: AtomicBool,
    run_again: AtomicBool,
}

impl WakeupPoke {
    const fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            run_again: AtomicBool::new(false),
        }
    }

    fn poke(&self, f: impl Fn()) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.run_again.store(true, Ordering::Release);
            return;
        }
        loop {
            self.run_again.store(false, Ordering::Release);
            f();
            self.running.store(false, Ordering::Release);
            if !self.run_again.load(Ordering::Acquire) {
                return;
            }
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }
}

/// One per blocked (or about-to-block) uthread. Linked, via weak
/// references, into every event queue it is currently waiting on.
pub struct WakeupController {
    poke: WakeupPoke,
    /// Set by a concurrent handler that observed new mbox content while
    /// this controller might be mid-transition (§4.6 step 4's
    /// "idempotent poke" case).
    check_evqs: AtomicBool,
    /// True once the uthread has actually parked (the callback passed to
    /// `uth_blockon_evqs`'s yield step has run).
    blocked: AtomicBool,
}

impl WakeupController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            poke: WakeupPoke::new(),
            check_evqs: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        })
    }

    /// Called by `EventQueue::wake_all_linked` when the mbox this
    /// controller is linked to gets a new message. Always sets
    /// `check_evqs`; only actually invokes `on_wake` if the uthread is
    /// (or was in the process of becoming) blocked, and coalesces
    /// concurrent callers so `on_wake` runs at most once per wakeup event
    /// even if several linked queues fire at once.
    pub fn poke(&self) {
        self.check_evqs.store(true, Ordering::Release);
    }

    /// Drive the coalesced wakeup: run `on_wake` (the 2LS's
    /// `uthread_runnable`-equivalent) if this controller is currently
    /// marked blocked, collapsing concurrent triggers into at most one
    /// call. Separate from `poke` because `poke` itself must never block
    /// or allocate (it can run from an event-posting context), while this
    /// is invoked from the 2LS's own event-handling loop.
    pub fn drive_wakeup(&self, on_wake: impl Fn()) {
        if !self.blocked.load(Ordering::Acquire) {
            return;
        }
        self.poke.poke(|| {
            if self.blocked.swap(false, Ordering::AcqRel) {
                on_wake();
            }
        });
    }

    fn take_check_evqs(&self) -> bool {
        self.check_evqs.swap(false, Ordering::AcqRel)
    }

    fn mark_blocked(&self) {
        self.blocked.store(true, Ordering::Release);
    }
}

/// Register `controller` on every queue in `evqs` (§4.6 step 2).
pub fn register_evq(evqs: &[&EventQueue], controller: &Arc<WakeupController>) {
    for evq in evqs {
        evq.link_wakeup(controller);
    }
}

/// Undo `register_evq`.
pub fn deregister_evq(evqs: &[&EventQueue], controller: &Arc<WakeupController>) {
    for evq in evqs {
        evq.unlink_wakeup(controller);
    }
}

fn poll_all(evqs: &[&EventQueue]) -> Option<(usize, EventMsg)> {
    for (i, evq) in evqs.iter().enumerate() {
        if let Some(msg) = evq.mbox().get_msg() {
            return Some((i, msg));
        }
    }
    None
}

/// Non-blocking poll across `evqs`: `Some((which, msg))` if any has a
/// message pending, `None` otherwise. Never registers a wait link.
pub fn uth_check_evqs(evqs: &[&EventQueue]) -> Option<(usize, EventMsg)> {
    poll_all(evqs)
}

/// Block the calling uthread until one of `evqs` has a message.
///
/// `do_yield` is called at most once, with a closure the 2LS must invoke
/// from the uthread's *new* stack once the uthread is safely parked (the
/// same ordering requirement `kthread::block_current` has in the kernel):
/// calling it marks this controller `blocked`, closing the race against a
/// concurrent `wake_all_linked` that fired the poke just before the mark.
///
/// Returns `(which, msg)` identifying which queue's message woke the
/// uthread, per spec.md's `uth_blockon_evqs(msg_out, which_out, evqs[])`
/// signature (collapsed here into a single return value).
pub fn uth_blockon_evqs(evqs: &[&EventQueue], do_yield: impl FnOnce(&dyn Fn())) -> (usize, EventMsg) {
    // Step 1: fast check.
    if let Some(found) = poll_all(evqs) {
        return found;
    }

    // Step 2: one wait link per evq.
    let controller = WakeupController::new();
    register_evq(evqs, &controller);

    loop {
        // Step 3: clear check_evqs, poll; if found, unlink and return.
        controller.take_check_evqs();
        if let Some(found) = poll_all(evqs) {
            deregister_evq(evqs, &controller);
            return found;
        }

        // Step 4: yield, marking blocked only once safely parked. If a
        // poke arrived in the window between the poll above and the mark
        // below, `check_evqs` will be set again and the next loop
        // iteration (driven by whichever handler called `drive_wakeup`
        // and found nothing to wake, since `blocked` hadn't been set
        // yet) re-polls instead of sleeping forever.
        let parked = core::cell::Cell::new(false);
        let mark: &dyn Fn() = &|| {
            controller.mark_blocked();
            parked.set(true);
        };
        do_yield(mark);

        if !parked.get() {
            // 2LS decided not to actually park (e.g. nothing to run);
            // re-poll rather than assume a wakeup is coming.
            continue;
        }

        // Resumed: either a real wakeup happened, or `check_evqs` was set
        // while we were transitioning and this loop notices it directly.
        if controller.take_check_evqs() {
            if let Some(found) = poll_all(evqs) {
                deregister_evq(evqs, &controller);
                return found;
            }
        }
    }
}

/// Array-returning variant matching spec.md §6's `uth_blockon_evqs_arr`
/// naming: identical protocol, `evqs` passed as a slice rather than a
/// fixed arity, which this crate's `uth_blockon_evqs` already does --
/// kept as a named alias so call sites can use either name, matching how
/// the original exposes both.
pub fn uth_blockon_evqs_arr(evqs: &[&EventQueue], do_yield: impl FnOnce(&dyn Fn())) -> (usize, EventMsg) {
    uth_blockon_evqs(evqs, do_yield)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::handler::EventQueueFlags;
    use crate::event::mbox::{Mbox, UcqMbox};

    #[test]
    fn fast_path_returns_without_registering() {
        let eq = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        if let Mbox::Ucq(m) = eq.mbox() {
            m.post(EventMsg::new(9, 0, 0, 0));
        }
        let evqs = [&eq];
        let (which, msg) = uth_blockon_evqs(&evqs, |_mark| panic!("should not yield"));
        assert_eq!(which, 0);
        assert_eq!(msg.ev_type, 9);
    }

    #[test]
    fn blocks_then_wakes_on_post_to_the_right_queue() {
        let e1 = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        let e2 = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        let e3 = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        let evqs = [&e1, &e2, &e3];

        // Simulate the 2LS: post to e2 "after" the uthread parks, inside
        // the do_yield callback itself (single-threaded test, so this
        // stands in for a concurrent poster).
        let (which, msg) = uth_blockon_evqs(&evqs, |mark| {
            mark();
            if let Mbox::Ucq(m) = e2.mbox() {
                m.post(EventMsg::new(5, 42, 0, 0));
            }
            e2.wake_all_linked();
        });
        assert_eq!(which, 1);
        assert_eq!(msg, EventMsg::new(5, 42, 0, 0));
        assert!(e2.mbox().is_empty());
    }

    #[test]
    fn drive_wakeup_is_noop_until_marked_blocked() {
        use core::sync::atomic::AtomicUsize;
        static WAKES: AtomicUsize = AtomicUsize::new(0);

        let controller = WakeupController::new();
        controller.poke(); // a stray poke before the uthread ever parks
        controller.drive_wakeup(|| {
            WAKES.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(WAKES.load(Ordering::SeqCst), 0, "not blocked yet, must not wake");

        controller.mark_blocked();
        controller.drive_wakeup(|| {
            WAKES.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(WAKES.load(Ordering::SeqCst), 1);

        // A second drive with nothing new to report is a no-op (already
        // unblocked).
        controller.drive_wakeup(|| {
            WAKES.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(WAKES.load(Ordering::SeqCst), 1);
    }
}
