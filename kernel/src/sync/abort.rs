//! Abortable sleepers.
//!
//! A kthread that blocks on behalf of a userspace syscall can register
//! itself as abortable: if the owning process is torn down or userspace
//! explicitly cancels the syscall, the sleeper is woken early with
//! `SC_ABORT` set rather than left to sleep forever. Aborts are best-effort
//! and idempotent -- there is no guarantee *which* in-flight syscall gets
//! aborted first, only that a targeted one eventually is.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::sync::condvar::CondVar;

bitflags::bitflags! {
    /// The subset of async-syscall flags the abort protocol negotiates.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SyscallFlags: u32 {
        /// Kernel has finished the syscall; result is ready.
        const SC_DONE = 1 << 0;
        /// Userspace asked to be notified via an event queue on completion.
        const SC_UEVENT = 1 << 1;
        /// The syscall was aborted; the sleeper should wake with an error
        /// instead of its normal result.
        const SC_ABORT = 1 << 2;
    }
}

/// A pending async syscall, as far as the abort protocol cares.
pub struct PendingSyscall {
    flags: AtomicU32,
}

impl PendingSyscall {
    pub const fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
        }
    }

    pub fn flags(&self) -> SyscallFlags {
        SyscallFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set(&self, flag: SyscallFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn is_aborted(&self) -> bool {
        self.flags().contains(SyscallFlags::SC_ABORT)
    }
}

impl Default for PendingSyscall {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered sleeper: the CV it is parked on and the syscall an
/// abort should flag.
///
/// `cv` is `'static` because every registered CV in this kernel is a
/// long-lived object (a page lock, a rendez, a wait queue embedded in a
/// kernel structure) -- never a CV local to a stack frame that could go
/// away while still registered.
struct CvLookupElm {
    cv: &'static CondVar,
    sysc: &'static PendingSyscall,
    /// Nonzero while an aborter is in the middle of claiming this element;
    /// deregistration spins until this drops back to zero so the aborter
    /// never touches a freed element.
    abort_in_progress: AtomicUsize,
}

/// Handle returned by [`reg_abortable_cv`]; hand it back to
/// [`dereg_abortable_cv`] to unregister.
pub struct AbortHandle {
    proc_id: u64,
    elm: *const CvLookupElm,
}

// SAFETY: `elm` points at a `Box` leaked into the process's abortable list
// and is only ever dereferenced while that list's lock is held.
unsafe impl Send for AbortHandle {}

struct AbortableList {
    elms: Vec<Box<CvLookupElm>>,
}

lazy_static::lazy_static! {
    static ref ABORTABLE: Mutex<BTreeMap<u64, AbortableList>> = Mutex::new(BTreeMap::new());
}

/// Whether the process is in the middle of a `DYING_ABORT` teardown. The
/// scheduler/process subsystem updates this as part of process exit.
static DYING_ABORT: Mutex<BTreeMap<u64, bool>> = Mutex::new(BTreeMap::new());

pub fn mark_dying_abort(proc_id: u64) {
    DYING_ABORT.lock().insert(proc_id, true);
}

fn is_dying_abort(proc_id: u64) -> bool {
    DYING_ABORT.lock().get(&proc_id).copied().unwrap_or(false)
}

/// Consulted by a would-be sleeper before blocking: if the process is
/// already tearing down, or the syscall has already been flagged aborted
/// by a racing aborter, there is no point sleeping at all.
pub fn should_abort(proc_id: u64, sysc: &PendingSyscall) -> bool {
    is_dying_abort(proc_id) || sysc.is_aborted()
}

/// Register the current sleeper as abortable. Must be called before
/// blocking on `cv`.
pub fn reg_abortable_cv(proc_id: u64, cv: &'static CondVar, sysc: &'static PendingSyscall) -> AbortHandle {
    let elm = Box::new(CvLookupElm {
        cv,
        sysc,
        abort_in_progress: AtomicUsize::new(0),
    });
    let ptr: *const CvLookupElm = elm.as_ref();
    let mut table = ABORTABLE.lock();
    table
        .entry(proc_id)
        .or_insert_with(|| AbortableList { elms: Vec::new() })
        .elms
        .push(elm);
    AbortHandle { proc_id, elm: ptr }
}

/// Deregister a sleeper once it has woken up (normally or via abort).
///
/// Spins on `abort_in_progress == 0` so that a concurrent aborter which has
/// already claimed this element finishes touching it before the element is
/// removed from the list.
pub fn dereg_abortable_cv(handle: AbortHandle) {
    loop {
        let mut table = ABORTABLE.lock();
        if let Some(list) = table.get_mut(&handle.proc_id) {
            if let Some(pos) = list.elms.iter().position(|e| core::ptr::eq(e.as_ref(), handle.elm)) {
                // SAFETY: `handle.elm` was produced from this exact `Box`
                // at registration time and has not been removed since.
                let still_claimed = unsafe { (*handle.elm).abort_in_progress.load(Ordering::Acquire) != 0 };
                if still_claimed {
                    drop(table);
                    core::hint::spin_loop();
                    continue;
                }
                list.elms.remove(pos);
            }
        }
        return;
    }
}

/// Best-effort: scan `proc_id`'s abortable list and abort every sleeper
/// found. Returns the number of sleepers aborted.
///
/// Matches `abort_sysc`/process-teardown's abort-all: each claimed element
/// gets `SC_ABORT` set on its syscall and its CV broadcast, waking the
/// sleeper (and everyone else on the same CV, since abort cannot target a
/// single waiter more precisely than that).
pub fn abort_all(proc_id: u64) -> usize {
    let table = ABORTABLE.lock();
    let Some(list) = table.get(&proc_id) else {
        return 0;
    };
    let mut n = 0;
    for elm in &list.elms {
        elm.abort_in_progress.fetch_add(1, Ordering::AcqRel);
        elm.sysc.set(SyscallFlags::SC_ABORT);
        elm.cv.broadcast();
        elm.abort_in_progress.fetch_sub(1, Ordering::Release);
        n += 1;
    }
    n
}

/// Abort a single syscall if it is found among `proc_id`'s registered
/// sleepers. Best-effort: if the sleeper already woke up and deregistered,
/// this is a silent no-op.
pub fn abort_sysc(proc_id: u64, sysc: &PendingSyscall) -> bool {
    let table = ABORTABLE.lock();
    let Some(list) = table.get(&proc_id) else {
        return false;
    };
    for elm in &list.elms {
        if core::ptr::eq(elm.sysc, sysc) {
            elm.abort_in_progress.fetch_add(1, Ordering::AcqRel);
            elm.sysc.set(SyscallFlags::SC_ABORT);
            elm.cv.broadcast();
            elm.abort_in_progress.fetch_sub(1, Ordering::Release);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn should_abort_reflects_flag() {
        let sysc = PendingSyscall::new();
        assert!(!should_abort(999, &sysc));
        sysc.set(SyscallFlags::SC_ABORT);
        assert!(should_abort(999, &sysc));
    }

    #[test_case]
    fn dying_abort_short_circuits() {
        let sysc = PendingSyscall::new();
        mark_dying_abort(12345);
        assert!(should_abort(12345, &sysc));
    }
}
