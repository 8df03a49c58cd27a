//! User-space event delivery, kernel side (C6).
//!
//! Spec.md §4.6 describes a full producer/consumer protocol: three mbox
//! transports, an event queue the kernel posts into, VCPD public/private
//! mailboxes a vcore drains, handler-chain dispatch, and uthreads
//! blocking on N event queues via wakeup controllers. Everything past
//! "write the message and maybe IPI" is consumer logic that runs in user
//! space with no kernel involvement (spec.md §2: "C6 lives in user space
//! but depends on kernel delivery of events posted via shared memory
//! regions the kernel writes and userspace reads"), so it is implemented
//! in `userland/libs/libveridian::event`, grounded on the wakeup-coalescing
//! `PokeTracker` pattern this crate already uses for `sched::ksched`.
//!
//! This module is the kernel's half: the mbox transports ([`mbox`]) and
//! the event queue / VCPD types plus `post_event` ([`queue`]).

pub mod mbox;
pub mod queue;

pub use mbox::{CeqMbox, EvBitmapMbox, EventMsg, Mbox, UcqMbox, EV_CHECK_MSGS, EV_EVENT};
pub use queue::{post_event, EventQueue, EventQueueFlags, Vcpd};
