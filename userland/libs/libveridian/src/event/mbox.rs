//! Event mailbox transports, user-space read side.
//!
//! Mirrors `kernel::event::mbox`'s three variants and shared `get_msg`/
//! `is_empty`/`post` contract (spec.md §4.6's first paragraph); see that
//! module's doc comment for why the kernel and this crate each keep their
//! own copy instead of sharing one type across the kernel/user boundary.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::spinlock::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMsg {
    pub ev_type: u16,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
}

impl EventMsg {
    pub const fn new(ev_type: u16, arg1: u64, arg2: u64, arg3: u64) -> Self {
        Self {
            ev_type,
            arg1,
            arg2,
            arg3,
        }
    }
}

/// Reserved event type carrying a nested event-queue pointer (see
/// `handler::handle_events`'s `EV_EVENT` case).
pub const EV_EVENT: u16 = 0xFFFE;
/// Sent by one vcore to another to defer a nested mbox-drain attempt
/// (`vcore::handle_an_mbox`'s re-entrancy guard).
pub const EV_CHECK_MSGS: u16 = 0xFFFD;

pub struct UcqMbox {
    queue: SpinLock<VecDeque<EventMsg>>,
}

impl UcqMbox {
    pub const fn new() -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn post(&self, msg: EventMsg) {
        self.queue.lock().push_back(msg);
    }

    pub fn get_msg(&self) -> Option<EventMsg> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

const WORD_BITS: u32 = u64::BITS;

pub struct EvBitmapMbox {
    bits: SpinLock<Vec<u64>>,
}

impl EvBitmapMbox {
    pub fn new(nr_events: u32) -> Self {
        let words = (nr_events as usize).div_ceil(WORD_BITS as usize).max(1);
        Self {
            bits: SpinLock::new(alloc::vec![0u64; words]),
        }
    }

    pub fn post(&self, ev_type: u16) {
        let mut bits = self.bits.lock();
        let idx = ev_type as usize;
        let word = idx / WORD_BITS as usize;
        if word < bits.len() {
            bits[word] |= 1u64 << (idx % WORD_BITS as usize);
        }
    }

    pub fn get_msg(&self) -> Option<EventMsg> {
        let mut bits = self.bits.lock();
        for (word_idx, word) in bits.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1u64 << bit);
                return Some(EventMsg::new((word_idx as u32 * WORD_BITS + bit) as u16, 0, 0, 0));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.bits.lock().iter().all(|w| *w == 0)
    }
}

/// `CeqMbox::new(nr_events, or_mask)` -- see `kernel::event::mbox::CeqMbox`
/// for the OR-reduction grounding note.
pub struct CeqMbox {
    or_mask: u32,
    pending_classes: SpinLock<Vec<u64>>,
}

impl CeqMbox {
    pub fn new(nr_events: u32, or_mask: u32) -> Self {
        let nr_classes = nr_events.max(1);
        let words = (nr_classes as usize).div_ceil(WORD_BITS as usize).max(1);
        Self {
            or_mask,
            pending_classes: SpinLock::new(alloc::vec![0u64; words]),
        }
    }

    pub fn post(&self, ev_type: u16) {
        let class = (ev_type as u32) & self.or_mask;
        let mut classes = self.pending_classes.lock();
        let word = class as usize / WORD_BITS as usize;
        if word < classes.len() {
            classes[word] |= 1u64 << (class % WORD_BITS);
        }
    }

    pub fn get_msg(&self) -> Option<EventMsg> {
        let mut classes = self.pending_classes.lock();
        for (word_idx, word) in classes.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1u64 << bit);
                return Some(EventMsg::new((word_idx as u32 * WORD_BITS + bit) as u16, 0, 0, 0));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.pending_classes.lock().iter().all(|w| *w == 0)
    }
}

/// Which transport to build; passed to [`event_mbox_init`].
pub enum MboxKind {
    Ucq,
    EvBitmap { nr_events: u32 },
    Ceq { nr_events: u32, or_mask: u32 },
}

/// `event_mbox_init`: construct the mbox half of a fresh event queue.
/// Named to match spec.md §6's userspace-library export list; the
/// kernel's mirror-image construction lives in `kernel::event::queue`
/// (there is no shared-memory allocator in this crate to actually carve
/// the backing pages from, so this just builds the local representation
/// described in this module's doc comment).
pub fn event_mbox_init(kind: MboxKind) -> Mbox {
    match kind {
        MboxKind::Ucq => Mbox::Ucq(UcqMbox::new()),
        MboxKind::EvBitmap { nr_events } => Mbox::EvBitmap(EvBitmapMbox::new(nr_events)),
        MboxKind::Ceq { nr_events, or_mask } => Mbox::Ceq(CeqMbox::new(nr_events, or_mask)),
    }
}

pub enum Mbox {
    Ucq(UcqMbox),
    EvBitmap(EvBitmapMbox),
    Ceq(CeqMbox),
}

impl Mbox {
    pub fn get_msg(&self) -> Option<EventMsg> {
        match self {
            Mbox::Ucq(m) => m.get_msg(),
            Mbox::EvBitmap(m) => m.get_msg(),
            Mbox::Ceq(m) => m.get_msg(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Mbox::Ucq(m) => m.is_empty(),
            Mbox::EvBitmap(m) => m.is_empty(),
            Mbox::Ceq(m) => m.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ucq_fifo() {
        let mbox = UcqMbox::new();
        mbox.post(EventMsg::new(1, 0, 0, 0));
        mbox.post(EventMsg::new(2, 0, 0, 0));
        assert_eq!(mbox.get_msg().unwrap().ev_type, 1);
        assert_eq!(mbox.get_msg().unwrap().ev_type, 2);
        assert!(mbox.is_empty());
    }

    #[test]
    fn evbitmap_coalesces() {
        let mbox = EvBitmapMbox::new(32);
        mbox.post(3);
        mbox.post(3);
        assert_eq!(mbox.get_msg().unwrap().ev_type, 3);
        assert!(mbox.is_empty());
    }
}
