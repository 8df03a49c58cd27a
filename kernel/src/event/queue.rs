//! Event queues and VCPD mailboxes: the kernel-side half of C6.
//!
//! An [`EventQueue`] is what kernel code posts events *into*; a [`Vcpd`]
//! (vcore preemption data) is the public/private mailbox pair a vcore
//! drains events *out of*. Handler dispatch, `uth_blockon_evqs`, and the
//! rest of the consumer-side machinery described in spec.md §4.6 live in
//! user space (`userland/libs/libveridian::event`) -- this module only
//! implements what the kernel itself does: write into a mbox, flip
//! `alert_pending`, and IPI the target vcore, per spec.md's "Event queue"
//! paragraph.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

use super::mbox::{EventMsg, Mbox};
use crate::error::EventError;
use crate::sched::smp;

bitflags! {
    /// Per-queue delivery policy, mirroring the source's `EVENT_*` flags
    /// consulted by `send_event`/`post_event`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventQueueFlags: u32 {
        /// IPI the target vcore after posting, instead of relying on the
        /// consumer to poll. Cleared for purely-polled queues.
        const WAKEUP = 1 << 0;
        /// Indirect: the message itself is `EV_EVENT` carrying a pointer
        /// to a nested queue (see `queue::dispatch_one` in the userland
        /// half); used to ferry kernel events through one well-known
        /// channel.
        const INDIR = 1 << 1;
        /// Spammy events (e.g. a timer tick) should not repeatedly IPI a
        /// vcore that hasn't drained the previous alert yet.
        const NO_SPAM = 1 << 2;
    }
}

/// IPI vector used to notify a vcore that an event queue has new
/// messages. Arbitrary but fixed, matching how the rest of `arch::`
/// reserves vectors for IPI classes.
pub const EVENT_IPI_VECTOR: u8 = 0xF1;

/// A channel kernel code posts events into. Spec.md's `{mbox, handler,
/// flags, alert_pending, vcore}` tuple: `handler` is a user-space
/// function-pointer concept with nothing for kernel code to call, so it
/// is omitted here and lives entirely in the userland `EventQueue`
/// counterpart that drains the same mbox.
pub struct EventQueue {
    mbox: Mbox,
    flags: EventQueueFlags,
    /// Set before the IPI is sent, cleared by the consumer once it has
    /// observed the mbox; lets a `NO_SPAM` queue skip redundant IPIs.
    alert_pending: AtomicBool,
    /// Target vcore, or `u32::MAX` if this queue is not bound to one
    /// (pure-poll queues).
    vcore: AtomicU32,
}

const NO_VCORE: u32 = u32::MAX;

impl EventQueue {
    pub const fn new(mbox: Mbox, flags: EventQueueFlags) -> Self {
        Self {
            mbox,
            flags,
            alert_pending: AtomicBool::new(false),
            vcore: AtomicU32::new(NO_VCORE),
        }
    }

    pub fn bind_vcore(&self, vcoreid: u32) {
        self.vcore.store(vcoreid, Ordering::Release);
    }

    pub fn mbox(&self) -> &Mbox {
        &self.mbox
    }

    pub fn alert_pending(&self) -> bool {
        self.alert_pending.load(Ordering::Acquire)
    }

    /// Consumer side: acknowledge that the mbox has been observed, so a
    /// `NO_SPAM` queue is willing to IPI again for the next message.
    pub fn clear_alert(&self) {
        self.alert_pending.store(false, Ordering::Release);
    }
}

/// Map a vcore id to the pcore currently running it, for IPI purposes.
/// Grounded on `sched::smp::send_ipi(target_cpu, vector)`; a real build
/// would consult the process's vcore map (spec.md §3's "Process" entity)
/// to translate vcoreid -> pcoreid. With no such table wired into this
/// core's scope, vcoreid is used directly as the pcore id, matching the
/// common case on small core counts this crate targets.
fn vcore_to_pcore(vcoreid: u32) -> u8 {
    vcoreid as u8
}

/// Kernel's `post_event`: write `msg` into `eq`'s mbox and, if the queue
/// asks for it, set `alert_pending` *before* IPI'ing the target vcore --
/// spec.md is explicit about this ordering ("it also sets alert_pending
/// before the IPI") so that a vcore woken by the interrupt never sees
/// `alert_pending == false` for a message that is already sitting in its
/// mbox.
pub fn post_event(eq: &EventQueue, msg: EventMsg) -> Result<(), EventError> {
    eq.mbox.post(msg)?;
    log::trace!(target: "event::queue", "posted ev_type={} to mbox", msg.ev_type);

    if !eq.flags.contains(EventQueueFlags::WAKEUP) {
        return Ok(());
    }
    if eq.flags.contains(EventQueueFlags::NO_SPAM) && eq.alert_pending() {
        // Already have an unobserved alert in flight; spec.md's
        // "documented as a deliberate simplification" notwithstanding,
        // NO_SPAM queues at least avoid redundant IPIs for the common
        // case of a fast producer and a slow consumer.
        return Ok(());
    }

    let vcoreid = eq.vcore.load(Ordering::Acquire);
    if vcoreid == NO_VCORE {
        return Err(EventError::VcoreNotMapped { vcoreid });
    }
    eq.alert_pending.store(true, Ordering::Release);
    smp::send_ipi(vcore_to_pcore(vcoreid), EVENT_IPI_VECTOR);
    log::debug!(target: "event::queue", "IPI'd vcore {vcoreid} for new event");
    Ok(())
}

/// Per-vcore, per-process shared mailbox pair: a "public" mbox any core
/// (including one servicing a different vcore) may post into, and a
/// "private" mbox only this vcore's own kernel-side delivery path uses.
/// Userland drains private before public on every entry (spec.md §4.6
/// "Handler dispatch").
pub struct Vcpd {
    pub public: EventQueue,
    pub private: EventQueue,
    /// Mirrors `alert_pending` at the VCPD granularity: set whenever
    /// either mbox gets a message meant to interrupt the vcore, cleared
    /// by `handle_events` once both have been drained.
    pub notif_pending: AtomicBool,
}

impl Vcpd {
    pub const fn new(public: EventQueue, private: EventQueue) -> Self {
        Self {
            public,
            private,
            notif_pending: AtomicBool::new(false),
        }
    }

    pub fn set_notif_pending(&self) {
        self.notif_pending.store(true, Ordering::Release);
    }

    pub fn clear_notif_pending(&self) {
        self.notif_pending.store(false, Ordering::Release);
    }

    pub fn has_notif_pending(&self) -> bool {
        self.notif_pending.load(Ordering::Acquire)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::event::mbox::UcqMbox;

    #[test]
    fn post_without_wakeup_never_needs_a_vcore() {
        let eq = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        // No `bind_vcore` call: a WAKEUP post would fail, a polled one
        // must not need a vcore at all.
        assert!(post_event(&eq, EventMsg::new(1, 0, 0, 0)).is_ok());
        assert_eq!(eq.mbox().get_msg(), Some(EventMsg::new(1, 0, 0, 0)));
    }

    #[test]
    fn wakeup_post_without_bound_vcore_errors() {
        let eq = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::WAKEUP);
        assert_eq!(
            post_event(&eq, EventMsg::new(1, 0, 0, 0)),
            Err(EventError::VcoreNotMapped { vcoreid: NO_VCORE })
        );
    }

    #[test]
    fn alert_pending_set_before_would_be_ipi() {
        let eq = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::WAKEUP);
        eq.bind_vcore(0);
        assert!(!eq.alert_pending());
        post_event(&eq, EventMsg::new(1, 0, 0, 0)).unwrap();
        assert!(eq.alert_pending());
        eq.clear_alert();
        assert!(!eq.alert_pending());
    }
}
