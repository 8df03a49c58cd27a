//! User-space event delivery (C6), consumer side.
//!
//! Pairs with `kernel::event` (the producer side: mboxes plus
//! `post_event`/`EventQueue`/`Vcpd` as the kernel writes them). This
//! module implements everything spec.md §4.6 describes as running in
//! user space: handler-chain dispatch ([`handler`]), uthread blocking on
//! N event queues with poke-coalesced wakeups ([`uthread`]), and the
//! cross-vcore mailbox-draining re-entrancy guard ([`vcore`]).
//!
//! See `DESIGN.md`'s C6 entry for why this lives in a separate module
//! from the kernel's `event` module rather than sharing types across the
//! address-space boundary, and for the Open Questions this split and the
//! `PokeTracker` reimplementation resolve.

mod spinlock;

pub mod handler;
pub mod mbox;
pub mod uthread;
pub mod vcore;

pub use handler::{
    handle_events, handle_events_global, register_ev_handler, EventQueue, EventQueueFlags,
    HandlerTable, Vcpd,
};
pub use mbox::{
    event_mbox_init, CeqMbox, EvBitmapMbox, EventMsg, Mbox, MboxKind, UcqMbox, EV_CHECK_MSGS,
    EV_EVENT,
};
pub use uthread::{
    deregister_evq, register_evq, uth_blockon_evqs, uth_blockon_evqs_arr, uth_check_evqs,
    WakeupController,
};
pub use vcore::{handle_an_mbox, VcoreDrainState};
