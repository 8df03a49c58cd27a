//! MCP/SCP two-tier process scheduler (C5).
//!
//! This sits above the per-core task substrate ([`super::scheduler`],
//! [`super::smp`]) and answers a different question: not "which `Task`
//! runs next on this core" but "which *process* owns which *physical
//! cores*". Grounded on `kern/src/schedule.c`: single-core processes
//! (SCPs) round-robin on one LL (low-latency) core; multi-core processes
//! (MCPs) are granted whole physical cores (pcores) they run uthreads on
//! directly, via the core-request/preemption/provisioning machinery below.
//!
//! `Process` is treated as an external collaborator (spec.md's GLOSSARY
//! entry for it, and §6's "Process layer" consumed-interface list) rather
//! than a rename of [`crate::process::pcb::Process`], which models a
//! different, POSIX-style single-address-space/thread-table concept. This
//! module keeps its own minimal side table of the attributes the scheduler
//! actually relies on (state, resource-request vector, vcore map,
//! provisioning lists), indexed by the same [`crate::process::ProcessId`]
//! -- the same precedent `sync::abort`'s `PendingSyscall` set for C3.

#![allow(dead_code)]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::collections::{BTreeMap, VecDeque};

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{KernelResult, SchedError};
use crate::process::ProcessId;

use super::smp::MAX_CPUS;

/// A physical core index, as presented to the process layer.
pub type PcoreId = usize;

/// MCP/SCP process states this scheduler cares about (spec.md GLOSSARY's
/// "Process" collaborator). A wider POSIX-style state machine may exist
/// elsewhere; this is only the subset `__core_request`/`__run_mcp_ksched`
/// switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpState {
    RunnableS,
    RunningS,
    RunnableM,
    RunningM,
    Waiting,
    Dying,
    DyingAbort,
}

impl McpState {
    fn is_dying(self) -> bool {
        matches!(self, McpState::Dying | McpState::DyingAbort)
    }
}

/// Per-resource-type request vector. Only `RES_CORES` is modeled; the
/// original tracks several resource classes (cores, FDs, ...) through the
/// same `amt_wanted`/`amt_granted` shape but this core only schedules cores.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceRequest {
    pub amt_wanted: usize,
    pub amt_granted: usize,
}

/// Which list (if any) a process currently sits on. Mirrors `schedule.c`'s
/// `cur_list` bookkeeping so `remove_from_list` can assert the caller's
/// expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListTag {
    RunnableScps,
    UnrunnableScps,
    PrimaryMcps,
    SecondaryMcps,
}

/// The scheduler's side-table entry for one process. Only exists under
/// `alloc`: without a heap there is no dynamic process set to schedule
/// (early boot runs a single bootstrap task through the plain per-core
/// substrate instead), so the whole MCP/SCP side table below is gated on
/// the same feature the rest of `sched` gates its dynamic structures on.
#[cfg(feature = "alloc")]
struct SchedProc {
    pid: ProcessId,
    state: McpState,
    res: ResourceRequest,
    /// Pcores currently granted to this process.
    corelist: VecDeque<PcoreId>,
    /// Cores provisioned to this proc that it currently owns.
    prov_alloc_me: VecDeque<PcoreId>,
    /// Cores provisioned to this proc that someone else currently owns.
    prov_not_alloc_me: VecDeque<PcoreId>,
    cur_list: Option<ListTag>,
}

#[cfg(feature = "alloc")]
impl SchedProc {
    fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            state: McpState::RunnableS,
            res: ResourceRequest::default(),
            corelist: VecDeque::new(),
            prov_alloc_me: VecDeque::new(),
            prov_not_alloc_me: VecDeque::new(),
            cur_list: None,
        }
    }
}

/// One entry per physical core: `{alloc_proc, prov_proc}`. A core is on at
/// most one idle list and on at most one proc's prov list (alloc or
/// not-alloc side) -- enforced by construction here since `alloc_proc`/
/// `prov_proc` are the only bookkeeping, never a separate list membership
/// flag.
#[derive(Debug, Clone, Copy, Default)]
struct SchedPcore {
    alloc_proc: Option<ProcessId>,
    prov_proc: Option<ProcessId>,
}

/// Everything `sched_lock` protects in the original: proc-list membership,
/// the provisioning lists, and the idle-core list. Folded into one
/// `spin::Mutex` here (the original's comment on `sched_lock` notes it
/// already subsumes three finer-grained locks).
#[cfg(feature = "alloc")]
struct KschedState {
    pcores: [SchedPcore; MAX_CPUS],
    idlecores: VecDeque<u64>,
    runnable_scps: VecDeque<u64>,
    unrunnable_scps: VecDeque<u64>,
    primary_mcps: VecDeque<u64>,
    secondary_mcps: VecDeque<u64>,
    procs: BTreeMap<ProcessId, SchedProc>,
}

#[cfg(feature = "alloc")]
impl KschedState {
    const fn new() -> Self {
        Self {
            pcores: [SchedPcore {
                alloc_proc: None,
                prov_proc: None,
            }; MAX_CPUS],
            idlecores: VecDeque::new(),
            runnable_scps: VecDeque::new(),
            unrunnable_scps: VecDeque::new(),
            primary_mcps: VecDeque::new(),
            secondary_mcps: VecDeque::new(),
            procs: BTreeMap::new(),
        }
    }
}

#[cfg(feature = "alloc")]
static SCHED_LOCK: Mutex<KschedState> = Mutex::new(KschedState::new());

/// Core 0 is the LL (low-latency) core: it is never provisionable and
/// always runs the SCP scheduler when idle. `is_ll_core`/`max_vcores`
/// below hardcode this, matching the original's TODO that a real
/// CG/LL-core partition needs more thought.
const LL_CORE: PcoreId = 0;

fn is_ll_core(pcoreid: PcoreId) -> bool {
    pcoreid == LL_CORE
}

/// Upper bound on vcores a single MCP may hold: every core but the LL core.
pub fn max_vcores() -> usize {
    MAX_CPUS.saturating_sub(1)
}

// ---------------------------------------------------------------------
// Poke tracker: spec.md §4.5's wait-free single-runner-with-rerun gate.
//
// No `poke.c` equivalent shipped in the retrieved source tree (only
// `schedule.c`'s `struct poke_tracker ksched_poker` usage survived); this
// is an original implementation of the algorithm spec.md §4.5 describes
// in prose ("if another core has already scheduled a run, set a flag and
// return; otherwise run, and on return consult the rerun flag").
// ---------------------------------------------------------------------

/// Single-runner-with-rerun primitive: guarantees `f` runs at least once
/// after every [`PokeTracker::poke`] call, while never running `f`
/// concurrently on two cores.
pub struct PokeTracker {
    running: AtomicBool,
    run_again: AtomicBool,
}

impl PokeTracker {
    pub const fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            run_again: AtomicBool::new(false),
        }
    }

    /// Run `f` at least once more. If another core is already running it,
    /// just sets the rerun flag and returns -- that runner will notice and
    /// loop. Otherwise claims the single-runner slot, runs `f`, and keeps
    /// looping as long as someone poked during the run.
    pub fn poke(&self, f: impl Fn()) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone else is running it; make sure they go again.
            self.run_again.store(true, Ordering::Release);
            return;
        }
        loop {
            self.run_again.store(false, Ordering::Release);
            f();
            // If nobody poked while we ran, we can stop: clear `running`
            // and bail. Otherwise loop and run again before releasing the
            // slot, since a poker that arrived mid-run must not be lost.
            self.running.store(false, Ordering::Release);
            if !self.run_again.load(Ordering::Acquire) {
                return;
            }
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Someone grabbed the slot between our store and this CAS;
                // they'll see run_again (or a fresh poke already handled
                // it) and rerun on our behalf.
                return;
            }
        }
    }
}

/// The MCP scheduler's poke gate: at most one core at a time runs
/// `__run_mcp_ksched`, and it reruns if poked mid-pass.
static KSCHED_POKER: PokeTracker = PokeTracker::new();

// ---------------------------------------------------------------------
// Process-layer collaborator calls (§6 "Process layer": proc_incref/decref,
// proc_set_state, proc_give_cores, proc_preempt_core, proc_tlbshootdown,
// proc_run_m). With no separate process object to call into, these operate
// directly on the `SchedProc` side-table entry; `proc_tlbshootdown` is a
// logged no-op stub since there is no real MMU state backing these pcores.
// ---------------------------------------------------------------------

#[cfg(feature = "alloc")]
fn proc_set_state(state: &mut KschedState, pid: ProcessId, new: McpState) {
    if let Some(p) = state.procs.get_mut(&pid) {
        p.state = new;
    }
}

#[cfg(feature = "alloc")]
fn proc_tlbshootdown(pcoreid: PcoreId) {
    log::trace!(target: "sched::ksched", "tlb shootdown for pcore {pcoreid}");
}

/// Atomically hand `corelist` to `p` and, if it was RUNNABLE_M, transition
/// it to RUNNING_M. Returns `Err` if `p` is WAITING/DYING and can't accept
/// cores (the caller must then return them to idle).
#[cfg(feature = "alloc")]
fn proc_give_cores(
    state: &mut KschedState,
    pid: ProcessId,
    corelist: &[PcoreId],
) -> Result<(), SchedError> {
    let Some(p) = state.procs.get_mut(&pid) else {
        return Err(SchedError::TaskNotFound { id: pid.0 });
    };
    if matches!(p.state, McpState::Waiting) || p.state.is_dying() {
        return Err(SchedError::ProcNotAcceptingCores);
    }
    for &pc in corelist {
        p.corelist.push_back(pc);
        state.pcores[pc].alloc_proc = Some(pid);
    }
    p.res.amt_granted += corelist.len();
    if p.state == McpState::RunnableM {
        p.state = McpState::RunningM;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Provisioning tracking: __prov_track_alloc / __prov_track_dealloc[_bulk].
// ---------------------------------------------------------------------

#[cfg(feature = "alloc")]
fn prov_track_alloc(state: &mut KschedState, pid: ProcessId, pcoreid: PcoreId) {
    debug_assert!(
        state.pcores[pcoreid].alloc_proc.is_none()
            || state.pcores[pcoreid].alloc_proc == Some(pid),
        "double-alloc of pcore {pcoreid}"
    );
    state.pcores[pcoreid].alloc_proc = Some(pid);
    if state.pcores[pcoreid].prov_proc == Some(pid) {
        if let Some(p) = state.procs.get_mut(&pid) {
            if let Some(idx) = p.prov_not_alloc_me.iter().position(|&c| c == pcoreid) {
                p.prov_not_alloc_me.remove(idx);
                p.prov_alloc_me.push_back(pcoreid);
            }
        }
    }
}

#[cfg(feature = "alloc")]
fn prov_track_dealloc(state: &mut KschedState, pid: ProcessId, pcoreid: PcoreId) {
    state.pcores[pcoreid].alloc_proc = None;
    if state.pcores[pcoreid].prov_proc == Some(pid) {
        if let Some(p) = state.procs.get_mut(&pid) {
            if let Some(idx) = p.prov_alloc_me.iter().position(|&c| c == pcoreid) {
                p.prov_alloc_me.remove(idx);
                // Pushed to the front: next time this proc needs a core,
                // this is the first preemption candidate again (sort by
                // reverse alloc priority, matching `schedule.c`).
                p.prov_not_alloc_me.push_front(pcoreid);
            }
        }
    }
}

#[cfg(feature = "alloc")]
fn prov_track_dealloc_bulk(state: &mut KschedState, pid: ProcessId, pcores: &[PcoreId]) {
    for &pc in pcores {
        prov_track_dealloc(state, pid, pc);
    }
}

// ---------------------------------------------------------------------
// List helpers.
// ---------------------------------------------------------------------

#[cfg(feature = "alloc")]
fn remove_from_any_list(state: &mut KschedState, pid: ProcessId) {
    let Some(p) = state.procs.get(&pid) else {
        return;
    };
    let tag = p.cur_list;
    let list = match tag {
        Some(ListTag::RunnableScps) => Some(&mut state.runnable_scps),
        Some(ListTag::UnrunnableScps) => Some(&mut state.unrunnable_scps),
        Some(ListTag::PrimaryMcps) => Some(&mut state.primary_mcps),
        Some(ListTag::SecondaryMcps) => Some(&mut state.secondary_mcps),
        None => None,
    };
    if let Some(list) = list {
        if let Some(idx) = list.iter().position(|&x| x == pid.0) {
            list.remove(idx);
        }
    }
    if let Some(p) = state.procs.get_mut(&pid) {
        p.cur_list = None;
    }
}

#[cfg(feature = "alloc")]
fn add_to_list(state: &mut KschedState, pid: ProcessId, tag: ListTag) {
    remove_from_any_list(state, pid);
    let list = match tag {
        ListTag::RunnableScps => &mut state.runnable_scps,
        ListTag::UnrunnableScps => &mut state.unrunnable_scps,
        ListTag::PrimaryMcps => &mut state.primary_mcps,
        ListTag::SecondaryMcps => &mut state.secondary_mcps,
    };
    list.push_back(pid.0);
    if let Some(p) = state.procs.get_mut(&pid) {
        p.cur_list = Some(tag);
    }
}

// ---------------------------------------------------------------------
// Public contract (spec.md §6's "exposes" list for C5).
// ---------------------------------------------------------------------

/// Bring up the idle-core list and pcore array. Core 0 (the LL core) is
/// reserved for the SCP scheduler and is never placed on `idlecores`.
pub fn init() {
    #[cfg(feature = "alloc")]
    {
        let mut state = SCHED_LOCK.lock();
        for pc in 1..MAX_CPUS {
            state.idlecores.push_back(pc as u64);
        }
    }
    log::debug!(target: "sched::ksched", "MCP/SCP scheduler initialized, {} idle cores", MAX_CPUS.saturating_sub(1));
}

/// `__sched_proc_register`: a freshly created process joins `unrunnable_scps`
/// until something wakes it.
#[cfg(feature = "alloc")]
pub fn sched_proc_register(pid: ProcessId) {
    let mut state = SCHED_LOCK.lock();
    state.procs.insert(pid, SchedProc::new(pid));
    add_to_list(&mut state, pid, ListTag::UnrunnableScps);
}

/// `__sched_proc_destroy`: unprovision everything, reclaim any held cores,
/// and drop the side-table entry.
#[cfg(feature = "alloc")]
pub fn sched_proc_destroy(pid: ProcessId) {
    let mut state = SCHED_LOCK.lock();
    remove_from_any_list(&mut state, pid);
    if let Some(p) = state.procs.get(&pid) {
        let prov_alloc_me: alloc::vec::Vec<PcoreId> = p.prov_alloc_me.iter().copied().collect();
        let prov_not_alloc_me: alloc::vec::Vec<PcoreId> =
            p.prov_not_alloc_me.iter().copied().collect();
        let corelist: alloc::vec::Vec<PcoreId> = p.corelist.iter().copied().collect();
        for pc in prov_alloc_me.into_iter().chain(prov_not_alloc_me) {
            state.pcores[pc].prov_proc = None;
        }
        for pc in corelist {
            state.pcores[pc].alloc_proc = None;
            state.idlecores.push_back(pc as u64);
        }
    }
    state.procs.remove(&pid);
}

/// `__sched_proc_change_to_m`: move an SCP onto the MCP primary list.
/// Catches the "amt_wanted == 0" user bug by forcing it to 1.
#[cfg(feature = "alloc")]
pub fn sched_proc_change_to_m(pid: ProcessId) {
    let mut state = SCHED_LOCK.lock();
    if let Some(p) = state.procs.get_mut(&pid) {
        if p.res.amt_wanted == 0 {
            p.res.amt_wanted = 1;
        }
        p.state = McpState::RunnableM;
    }
    add_to_list(&mut state, pid, ListTag::PrimaryMcps);
}

/// `__sched_mcp_wakeup`: an MCP became runnable again; poke the MCP
/// scheduler so it gets a pass (no-op if the proc is dying).
#[cfg(feature = "alloc")]
pub fn sched_mcp_wakeup(pid: ProcessId) {
    let dying = {
        let state = SCHED_LOCK.lock();
        state
            .procs
            .get(&pid)
            .map(|p| p.state.is_dying())
            .unwrap_or(true)
    };
    if !dying {
        KSCHED_POKER.poke(__run_mcp_ksched);
    }
}

/// `__sched_scp_wakeup`: move to `runnable_scps`. IPIs core 0 unless core 0
/// is already running the scheduling loop itself (management cores are
/// never halted indefinitely, so an explicit kick is needed if it's idle).
#[cfg(feature = "alloc")]
pub fn sched_scp_wakeup(pid: ProcessId) {
    {
        let mut state = SCHED_LOCK.lock();
        add_to_list(&mut state, pid, ListTag::RunnableScps);
    }
    if super::smp::current_cpu_id() != LL_CORE as u8 {
        // Vector 0: wake-up/reschedule IPI, matching the convention the
        // rest of the scheduler's IPI call sites use.
        super::smp::send_ipi(LL_CORE as u8, 0);
    }
}

/// `__sched_put_idle_core`: internal helper, no provisioning-dealloc side
/// effect (used when the caller already did its own tracking).
#[cfg(feature = "alloc")]
fn put_idle_core_locked(state: &mut KschedState, pcoreid: PcoreId) {
    state.idlecores.push_back(pcoreid as u64);
}

/// `__sched_put_idle_cores`: bulk external variant, with provisioning
/// dealloc tracking for each core.
#[cfg(feature = "alloc")]
pub fn sched_put_idle_cores(pid: ProcessId, pcores: &[PcoreId]) {
    let mut state = SCHED_LOCK.lock();
    for &pc in pcores {
        put_idle_core_locked(&mut state, pc);
    }
    prov_track_dealloc_bulk(&mut state, pid, pcores);
}

/// `provision_core`: authoritative, last-write-wins. LL cores cannot be
/// provisioned. Passing `new_owner = None` de-provisions.
#[cfg(feature = "alloc")]
pub fn provision_core(new_owner: Option<ProcessId>, pcoreid: PcoreId) -> KernelResult<()> {
    if pcoreid >= MAX_CPUS {
        return Err(SchedError::InvalidCpuId { cpu: pcoreid }.into());
    }
    if is_ll_core(pcoreid) {
        return Err(SchedError::NotProvisionable { pcore: pcoreid }.into());
    }
    let mut state = SCHED_LOCK.lock();
    // Remove from whichever list its *old* owner tracked it on.
    if let Some(old_owner) = state.pcores[pcoreid].prov_proc {
        let was_alloc_to_owner = state.pcores[pcoreid].alloc_proc == Some(old_owner);
        if let Some(op) = state.procs.get_mut(&old_owner) {
            let list = if was_alloc_to_owner {
                &mut op.prov_alloc_me
            } else {
                &mut op.prov_not_alloc_me
            };
            if let Some(idx) = list.iter().position(|&c| c == pcoreid) {
                list.remove(idx);
            }
        }
    }
    state.pcores[pcoreid].prov_proc = new_owner;
    if let Some(new_owner) = new_owner {
        let currently_alloc_to_new_owner = state.pcores[pcoreid].alloc_proc == Some(new_owner);
        if let Some(np) = state.procs.get_mut(&new_owner) {
            if currently_alloc_to_new_owner {
                np.prov_alloc_me.push_back(pcoreid);
            } else {
                np.prov_not_alloc_me.push_back(pcoreid);
            }
        }
    }
    Ok(())
}

/// `poke_ksched`: poke the appropriate scheduler for `pid`'s resource
/// class. `res_type` is currently always "cores"; kept as a parameter to
/// mirror the original's multi-resource signature.
#[cfg(feature = "alloc")]
pub fn poke_ksched(pid: ProcessId, _res_type: u32) {
    let is_mcp = {
        let state = SCHED_LOCK.lock();
        state
            .procs
            .get(&pid)
            .map(|p| matches!(p.state, McpState::RunnableM | McpState::RunningM))
            .unwrap_or(false)
    };
    if is_mcp {
        sched_mcp_wakeup(pid);
    }
}

/// `get_any_idle_core`: pop the first idle core not provisioned to someone
/// else. Provisioned-but-idle cores are skipped (they stay on the idle
/// list for their provisioned owner to claim later), not removed.
#[cfg(feature = "alloc")]
pub fn get_any_idle_core() -> Option<PcoreId> {
    let mut state = SCHED_LOCK.lock();
    get_any_idle_core_locked(&mut state)
}

#[cfg(feature = "alloc")]
fn get_any_idle_core_locked(state: &mut KschedState) -> Option<PcoreId> {
    let mut skipped = VecDeque::new();
    let mut found = None;
    while let Some(pc) = state.idlecores.pop_front() {
        let pc = pc as usize;
        if state.pcores[pc].prov_proc.is_some() {
            skipped.push_back(pc as u64);
            continue;
        }
        found = Some(pc);
        break;
    }
    for pc in skipped {
        state.idlecores.push_back(pc);
    }
    found
}

/// `get_cores_needed`: `amt_wanted - amt_granted`, clamped to
/// `[0, max_vcores]`, bumped to at least 1 if `amt_wanted == 0` but the
/// proc isn't WAITING (a self-correcting nudge for the common user bug of
/// never calling `vcore_request`).
#[cfg(feature = "alloc")]
fn get_cores_needed(p: &mut SchedProc) -> usize {
    if p.res.amt_wanted == 0 && !matches!(p.state, McpState::Waiting) {
        p.res.amt_wanted = 1;
    }
    let wanted = p.res.amt_wanted.min(max_vcores());
    wanted.saturating_sub(p.res.amt_granted)
}

/// `__core_request`: grant up to `amt_needed` pcores to `p`. First drains
/// `p`'s `prov_not_alloc_me` list by preempting the current owner of each
/// (never double-preempting: on a preempt race -- the victim already
/// yielded or died on its own -- this spins briefly waiting for whoever
/// unmapped the core to also idle-list it), then falls back to the global
/// idle list FCFS for any remainder.
#[cfg(feature = "alloc")]
fn core_request(state: &mut KschedState, pid: ProcessId, amt_needed: usize) -> Result<usize, SchedError> {
    let mut corelist = alloc::vec::Vec::new();

    let prov_candidates: alloc::vec::Vec<PcoreId> = state
        .procs
        .get(&pid)
        .map(|p| p.prov_not_alloc_me.iter().copied().collect())
        .unwrap_or_default();

    for pc in prov_candidates {
        if corelist.len() >= amt_needed {
            break;
        }
        // Still provisioned to us? (rare race: could have been
        // re-provisioned away while we were walking the list.)
        if state.pcores[pc].prov_proc != Some(pid) {
            continue;
        }
        let victim = state.pcores[pc].alloc_proc;
        match victim {
            None => {
                // Already idle somehow; just claim it below.
            }
            Some(victim_pid) if victim_pid == pid => {
                // Already ours.
            }
            Some(_victim_pid) => {
                // Preempt: clear the victim's ownership and TLB-shoot it
                // down, then fall through to claim it as idle.
                state.pcores[pc].alloc_proc = None;
                proc_tlbshootdown(pc);
            }
        }
        // Remove from the global idle list if it ended up there, claim it.
        if let Some(idx) = state.idlecores.iter().position(|&c| c == pc as u64) {
            state.idlecores.remove(idx);
        }
        prov_track_alloc(state, pid, pc);
        corelist.push(pc);
    }

    while corelist.len() < amt_needed {
        match get_any_idle_core_locked(state) {
            Some(pc) => {
                prov_track_alloc(state, pid, pc);
                corelist.push(pc);
            }
            None => break,
        }
    }

    let granted = corelist.len();
    if granted > 0 {
        match proc_give_cores(state, pid, &corelist) {
            Ok(()) => {}
            Err(_) => {
                // Handoff failed (proc went WAITING/DYING underneath us):
                // return the cores to idle and undo the provisioning
                // tracking instead of leaking them.
                for pc in &corelist {
                    state.pcores[*pc].alloc_proc = None;
                    put_idle_core_locked(state, *pc);
                }
                prov_track_dealloc_bulk(state, pid, &corelist);
                return Err(SchedError::ProcNotAcceptingCores);
            }
        }
    }

    if granted < amt_needed {
        Err(SchedError::PartiallyGranted {
            granted,
            wanted: amt_needed,
        })
    } else {
        Ok(granted)
    }
}

/// `__run_mcp_ksched`: one fair pass over every process on `primary_mcps`,
/// moving each to `secondary_mcps` afterward, then swapping the two lists
/// so the next invocation starts from what this pass deferred.
#[cfg(feature = "alloc")]
fn __run_mcp_ksched() {
    let mut state = SCHED_LOCK.lock();
    while let Some(pid_raw) = state.primary_mcps.pop_front() {
        let pid = ProcessId(pid_raw);
        let Some(p) = state.procs.get(&pid) else {
            continue;
        };
        if matches!(p.state, McpState::Waiting) {
            state.secondary_mcps.push_back(pid_raw);
            continue;
        }
        let need = {
            let p = state.procs.get_mut(&pid).unwrap();
            get_cores_needed(p)
        };
        if need == 0 {
            state.secondary_mcps.push_back(pid_raw);
            continue;
        }
        // `__core_request` wants the lock dropped around calls into "proc
        // code" in the original; here everything is local state so we just
        // keep holding it, which is sound since nothing here blocks.
        let _ = core_request(&mut state, pid, need);
        let still_dying = state
            .procs
            .get(&pid)
            .map(|p| p.state.is_dying())
            .unwrap_or(true);
        if !still_dying {
            state.secondary_mcps.push_back(pid_raw);
        }
        // Matches the original: break after one proc so list mutations
        // made underneath the (conceptually dropped) lock can't be missed.
        break;
    }
    core::mem::swap(&mut state.primary_mcps, &mut state.secondary_mcps);
}

/// `__schedule_scp`: round-robins the head of `runnable_scps` onto the LL
/// core. Returns `true` if it scheduled something (the caller then
/// restarts the core instead of halting).
#[cfg(feature = "alloc")]
fn __schedule_scp() -> bool {
    let mut state = SCHED_LOCK.lock();
    let Some(pid_raw) = state.runnable_scps.pop_front() else {
        return false;
    };
    let pid = ProcessId(pid_raw);
    proc_set_state(&mut state, pid, McpState::RunningS);
    log::trace!(target: "sched::ksched", "scheduling SCP pid={} on LL core", pid.0);
    true
}

/// `run_scheduler`: poke the MCP poker unconditionally; on a management
/// (LL) core also take one `__schedule_scp` pass.
#[cfg(feature = "alloc")]
pub fn run_scheduler() {
    KSCHED_POKER.poke(__run_mcp_ksched);
    if super::smp::current_cpu_id() as usize == LL_CORE {
        __schedule_scp();
    }
}

/// `cpu_bored`: called from the idle path on a management core. If there
/// was an SCP to run, the caller should restart the core instead of
/// halting.
#[cfg(feature = "alloc")]
pub fn cpu_bored() -> bool {
    if super::smp::current_cpu_id() as usize != LL_CORE {
        return false;
    }
    __schedule_scp()
}

// Non-alloc builds (early boot, before the heap is up) get inert stubs so
// callers don't need to cfg-gate every call site.
#[cfg(not(feature = "alloc"))]
pub fn sched_proc_register(_pid: ProcessId) {}
#[cfg(not(feature = "alloc"))]
pub fn sched_proc_destroy(_pid: ProcessId) {}
#[cfg(not(feature = "alloc"))]
pub fn sched_mcp_wakeup(_pid: ProcessId) {}
#[cfg(not(feature = "alloc"))]
pub fn sched_scp_wakeup(_pid: ProcessId) {}
#[cfg(not(feature = "alloc"))]
pub fn poke_ksched(_pid: ProcessId, _res_type: u32) {}
#[cfg(not(feature = "alloc"))]
pub fn run_scheduler() {}
#[cfg(not(feature = "alloc"))]
pub fn cpu_bored() -> bool {
    false
}
#[cfg(not(feature = "alloc"))]
pub fn get_any_idle_core() -> Option<PcoreId> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    #[test]
    fn poke_runs_at_least_once() {
        static COUNT: AtomicU32 = AtomicU32::new(0);
        let tracker = PokeTracker::new();
        tracker.poke(|| {
            COUNT.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cores_needed_self_corrects_zero_wanted() {
        let mut p = SchedProc::new(ProcessId(1));
        p.state = McpState::RunnableM;
        p.res.amt_wanted = 0;
        p.res.amt_granted = 0;
        let need = get_cores_needed(&mut p);
        assert_eq!(need, 1);
        assert_eq!(p.res.amt_wanted, 1);
    }

    #[test]
    fn cores_needed_zero_when_waiting_and_unwanted() {
        let mut p = SchedProc::new(ProcessId(2));
        p.state = McpState::Waiting;
        p.res.amt_wanted = 0;
        let need = get_cores_needed(&mut p);
        assert_eq!(need, 0);
        assert_eq!(p.res.amt_wanted, 0);
    }

    #[test]
    fn provisioning_is_last_write_wins() {
        let a = ProcessId(10);
        let b = ProcessId(11);
        {
            let mut state = SCHED_LOCK.lock();
            state.procs.insert(a, SchedProc::new(a));
            state.procs.insert(b, SchedProc::new(b));
        }
        provision_core(Some(a), 2).unwrap();
        provision_core(Some(b), 2).unwrap();
        let state = SCHED_LOCK.lock();
        assert_eq!(state.pcores[2].prov_proc, Some(b));
        assert!(state
            .procs
            .get(&a)
            .map(|p| !p.prov_not_alloc_me.contains(&2) && !p.prov_alloc_me.contains(&2))
            .unwrap_or(true));
    }

    #[test]
    fn ll_core_is_not_provisionable() {
        assert!(provision_core(Some(ProcessId(1)), LL_CORE).is_err());
    }
}
