//! Event queues and handler-chain dispatch (consumer side of C6).
//!
//! Spec.md §4.6: "A vcore on entry drains its VCPD private then public
//! mbox; for each message, looks up a handler-chain by `ev_type` and runs
//! every handler in turn. The special `EV_EVENT` handler reads a nested
//! ev_queue pointer out of the message and drains it recursively."

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::mbox::{EventMsg, Mbox, EV_EVENT};
use super::spinlock::SpinLock;
use super::uthread::WakeupController;

/// A minimal `bitflags!`-alike so this crate does not need the `bitflags`
/// crate as a dependency (see `spinlock.rs`'s doc comment on keeping this
/// crate dependency-free). Only the handful of operations this module
/// actually uses are implemented.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($ty);

        impl $name {
            $(pub const $variant: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// Per-queue delivery policy -- the userland mirror of
    /// `kernel::event::queue::EventQueueFlags` (same bit meanings, kept as
    /// a small local bitflags rather than sharing the kernel's type across
    /// the address-space boundary).
    pub struct EventQueueFlags: u32 {
        const WAKEUP = 1 << 0;
        const INDIR = 1 << 1;
        const NO_SPAM = 1 << 2;
    }
}

/// Event queue a vcore drains. `handler` lives only here (not in the
/// kernel's counterpart): a function-pointer-plus-opaque-data callback
/// per spec.md's design notes ("model as capability interfaces (one
/// method each)").
pub struct EventQueue {
    mbox: Mbox,
    flags: EventQueueFlags,
    alert_pending: AtomicBool,
    vcore: AtomicU32,
    /// Uthreads parked on this queue via `uth_blockon_evqs`; see
    /// `uthread.rs`. A spinlock-guarded `Vec` of weak links, mirroring
    /// `mm::pagemap::PageMap`'s VMR reverse-map list (see `DESIGN.md`).
    wakeup_links: SpinLock<Vec<Weak<WakeupController>>>,
}

impl EventQueue {
    pub const fn new(mbox: Mbox, flags: EventQueueFlags) -> Self {
        Self {
            mbox,
            flags,
            alert_pending: AtomicBool::new(false),
            vcore: AtomicU32::new(u32::MAX),
            wakeup_links: SpinLock::new(Vec::new()),
        }
    }

    pub fn mbox(&self) -> &Mbox {
        &self.mbox
    }

    pub fn flags(&self) -> EventQueueFlags {
        self.flags
    }

    pub fn alert_pending(&self) -> bool {
        self.alert_pending.load(Ordering::Acquire)
    }

    pub fn clear_alert(&self) {
        self.alert_pending.store(false, Ordering::Release);
    }

    pub fn bind_vcore(&self, vcoreid: u32) {
        self.vcore.store(vcoreid, Ordering::Release);
    }

    /// Link a wakeup controller into this queue's sleeper list (§4.6 step
    /// 2, "build one wait link per evq"). Called by
    /// `uthread::register_evq`.
    pub fn link_wakeup(&self, controller: &Arc<WakeupController>) {
        self.wakeup_links.lock().push(Arc::downgrade(controller));
    }

    /// Drop dead/matching links and poke everyone still alive -- §4.6's
    /// "Wakeup broadcast": every linked sleep controller is poked,
    /// coalesced by each controller's own poke tracker.
    pub fn wake_all_linked(&self) {
        let mut links = self.wakeup_links.lock();
        links.retain(|weak| {
            if let Some(controller) = weak.upgrade() {
                controller.poke();
                true
            } else {
                false
            }
        });
    }

    pub fn unlink_wakeup(&self, controller: &Arc<WakeupController>) {
        let mut links = self.wakeup_links.lock();
        links.retain(|weak| !core::ptr::eq(weak.as_ptr(), Arc::as_ptr(controller)));
    }
}

type HandlerFn = fn(&EventMsg, usize);

/// Handler chain keyed by `ev_type`; every registered handler for a type
/// runs in registration order (§4.6: "runs every handler in turn").
pub struct HandlerTable {
    chains: SpinLock<BTreeMap<u16, Vec<(HandlerFn, usize)>>>,
}

impl HandlerTable {
    pub const fn new() -> Self {
        Self {
            chains: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Register `handler` (plus an opaque `data` word passed back on
    /// every invocation) for `ev_type`.
    pub fn register_ev_handler(&self, ev_type: u16, handler: HandlerFn, data: usize) {
        self.chains
            .lock()
            .entry(ev_type)
            .or_default()
            .push((handler, data));
    }

    fn dispatch_one(&self, msg: &EventMsg) {
        if msg.ev_type == EV_EVENT {
            // arg1 carries the nested queue's address; recurse into it
            // exactly as spec.md describes ("reads a nested ev_queue
            // pointer out of the message and drains it recursively").
            let nested = msg.arg1 as *const EventQueue;
            if !nested.is_null() {
                // SAFETY: callers that post `EV_EVENT` are required to
                // keep the nested queue alive at least as long as this
                // message can be drained; this mirrors the source's raw
                // `ev_queue *` ferried through a message payload.
                let queue = unsafe { &*nested };
                drain_queue(queue, self);
            }
            return;
        }
        let chains = self.chains.lock();
        if let Some(handlers) = chains.get(&msg.ev_type) {
            for (handler, data) in handlers {
                handler(msg, *data);
            }
        }
    }
}

/// Drain every message currently in `queue`'s mbox through `table`.
fn drain_queue(queue: &EventQueue, table: &HandlerTable) {
    while let Some(msg) = queue.mbox.get_msg() {
        table.dispatch_one(&msg);
    }
    queue.clear_alert();
}

/// Per-vcore, per-process mailbox pair: public (any core may post) and
/// private (only this vcore's own delivery path posts into it).
pub struct Vcpd {
    pub public: EventQueue,
    pub private: EventQueue,
    notif_pending: AtomicBool,
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

    pub fn has_notif_pending(&self) -> bool {
        self.notif_pending.load(Ordering::Acquire)
    }
}

/// `handle_events`: drain the VCPD's private mbox, then its public mbox,
/// dispatching every message through `table` -- the fixed order spec.md
/// §4.6 specifies.
pub fn handle_events(vcpd: &Vcpd, table: &HandlerTable) {
    drain_queue(&vcpd.private, table);
    drain_queue(&vcpd.public, table);
    vcpd.notif_pending.store(false, Ordering::Release);
}

/// Process-global handler registry, matching the original's single
/// per-process `handler_wq[]` array (spec.md §6 names `register_ev_handler`
/// as a bare function, not a method on an explicit table). Most callers
/// want this one; `HandlerTable` stays a standalone type for tests and for
/// any process that wants an isolated registry (e.g. the cross-vcore
/// drain tests in `vcore.rs` build their own rather than touching process
/// state).
static GLOBAL_HANDLERS: HandlerTable = HandlerTable::new();

/// Register `handler` for `ev_type` in the process-global handler table.
pub fn register_ev_handler(ev_type: u16, handler: HandlerFn, data: usize) {
    GLOBAL_HANDLERS.register_ev_handler(ev_type, handler, data);
}

/// `handle_events` against the process-global handler table.
pub fn handle_events_global(vcpd: &Vcpd) {
    handle_events(vcpd, &GLOBAL_HANDLERS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::mbox::UcqMbox;
    use core::sync::atomic::AtomicUsize;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn bump(_msg: &EventMsg, _data: usize) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn handler_chain_runs_every_registered_handler() {
        CALLS.store(0, Ordering::SeqCst);
        let table = HandlerTable::new();
        table.register_ev_handler(7, bump, 0);
        table.register_ev_handler(7, bump, 1);

        let private = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        let public = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        if let Mbox::Ucq(m) = private.mbox() {
            m.post(EventMsg::new(7, 0, 0, 0));
        }
        let vcpd = Vcpd::new(public, private);
        handle_events(&vcpd, &table);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn private_drains_before_public() {
        let table = HandlerTable::new();
        static ORDER: SpinLock<Vec<u16>> = SpinLock::new(Vec::new());
        fn record(msg: &EventMsg, _data: usize) {
            ORDER.lock().push(msg.ev_type);
        }
        table.register_ev_handler(1, record, 0);
        table.register_ev_handler(2, record, 0);

        let private = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        let public = EventQueue::new(Mbox::Ucq(UcqMbox::new()), EventQueueFlags::empty());
        if let Mbox::Ucq(m) = public.mbox() {
            m.post(EventMsg::new(2, 0, 0, 0));
        }
        if let Mbox::Ucq(m) = private.mbox() {
            m.post(EventMsg::new(1, 0, 0, 0));
        }
        let vcpd = Vcpd::new(public, private);
        handle_events(&vcpd, &table);
        assert_eq!(&*ORDER.lock(), &[1u16, 2u16]);
    }
}
