//! Cross-vcore mailbox draining re-entrancy guard (§4.6, last paragraph).
//!
//! "When a vcore notices that another vcore's public mbox has messages
//! ... it switches to a sentinel state `__vc_handle_an_mbox := true,
//! __vc_rem_vcoreid := victim` and tail-calls through `vcore_entry` on a
//! fresh stack, so the main handling path can drain the remote mbox
//! without recursion. Nested attempts send themselves an `EV_CHECK_MSGS`
//! to defer."

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::handler::{handle_events, HandlerTable, Vcpd};
use super::mbox::{EventMsg, Mbox, EV_CHECK_MSGS};

/// Per-vcore sentinel state: which remote vcore (if any) this vcore is
/// currently draining on behalf of. One instance per vcore the 2LS runs;
/// callers own the array/indexing, this just tracks one vcore's slot.
pub struct VcoreDrainState {
    handling_remote: AtomicBool,
    remote_vcoreid: AtomicU32,
    /// Self-addressed deferral queue: `EV_CHECK_MSGS` posted here when a
    /// nested drain attempt is deferred, drained on the next normal
    /// `handle_events` pass.
    self_queue: Mbox,
}

const NO_VCORE: u32 = u32::MAX;

impl VcoreDrainState {
    pub fn new() -> Self {
        Self {
            handling_remote: AtomicBool::new(false),
            remote_vcoreid: AtomicU32::new(NO_VCORE),
            self_queue: Mbox::Ucq(super::mbox::UcqMbox::new()),
        }
    }

    pub fn is_handling_remote(&self) -> bool {
        self.handling_remote.load(Ordering::Acquire)
    }

    pub fn remote_vcoreid(&self) -> Option<u32> {
        match self.remote_vcoreid.load(Ordering::Acquire) {
            NO_VCORE => None,
            id => Some(id),
        }
    }

    /// Attempt to begin draining `victim`'s public mbox. If this vcore is
    /// already mid-drain (nested attempt), defers by posting
    /// `EV_CHECK_MSGS` to its own self-queue and returns `false` instead
    /// of recursing. On success, the sentinel is set and the caller is
    /// expected to tail-call into its `vcore_entry`-equivalent to
    /// actually perform the drain on a fresh stack, then call
    /// [`VcoreDrainState::finish`].
    pub fn try_begin(&self, victim: u32) -> bool {
        if self
            .handling_remote
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if let Mbox::Ucq(m) = &self.self_queue {
                m.post(EventMsg::new(EV_CHECK_MSGS, victim as u64, 0, 0));
            }
            return false;
        }
        self.remote_vcoreid.store(victim, Ordering::Release);
        true
    }

    pub fn finish(&self) {
        self.remote_vcoreid.store(NO_VCORE, Ordering::Release);
        self.handling_remote.store(false, Ordering::Release);
    }

    /// Drain deferred `EV_CHECK_MSGS` self-posts, returning the list of
    /// vcore ids whose drain was deferred and should be retried.
    pub fn take_deferred(&self) -> alloc::vec::Vec<u32> {
        let mut deferred = alloc::vec::Vec::new();
        while let Some(msg) = self.self_queue.get_msg() {
            if msg.ev_type == EV_CHECK_MSGS {
                deferred.push(msg.arg1 as u32);
            }
        }
        deferred
    }
}

impl Default for VcoreDrainState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain `remote`'s VCPD through `table` if `state` is not already
/// mid-drain; returns whether the drain actually ran (`false` means it
/// was deferred via `EV_CHECK_MSGS`, matching spec.md's "nested attempts
/// send themselves an EV_CHECK_MSGS to defer").
pub fn handle_an_mbox(state: &VcoreDrainState, victim: u32, remote_vcpd: &Vcpd, table: &HandlerTable) -> bool {
    if !state.try_begin(victim) {
        return false;
    }
    handle_events(remote_vcpd, table);
    state.finish();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::handler::EventQueueFlags;
    use crate::event::mbox::UcqMbox;

    #[test]
    fn nested_attempt_defers_instead_of_recursing() {
        let state = VcoreDrainState::new();
        assert!(state.try_begin(2));
        // A nested attempt while already handling vcore 2 must defer.
        assert!(!state.try_begin(3));
        assert_eq!(state.take_deferred(), alloc::vec![3u32]);
        state.finish();
        assert!(!state.is_handling_remote());
    }

    #[test]
    fn handle_an_mbox_drains_then_releases_the_sentinel() {
        let state = VcoreDrainState::new();
        let table = HandlerTable::new();
        let public = super::super::handler::EventQueue::new(
            Mbox::Ucq(UcqMbox::new()),
            EventQueueFlags::empty(),
        );
        let private = super::super::handler::EventQueue::new(
            Mbox::Ucq(UcqMbox::new()),
            EventQueueFlags::empty(),
        );
        let vcpd = Vcpd::new(public, private);

        assert!(handle_an_mbox(&state, 1, &vcpd, &table));
        assert!(!state.is_handling_remote());
        assert_eq!(state.remote_vcoreid(), None);
    }
}
