//! Kernel threads with swappable stacks.
//!
//! A kthread is the kernel's unit of blockable execution: a saved context
//! plus the stack it runs on. Kernel code never blocks on its "current"
//! stack -- it swaps onto a fresh (or recycled) kthread and stack, parks
//! the old one on a wait queue, and resumes later by swapping back. This
//! mirrors the stack-swap resumption described for semaphores: the
//! outgoing kthread moves into a per-CPU "spare" slot so the CPU always
//! has exactly one free stack to release the next time it blocks.
//!
//! There is no kernel preemption of kthreads: a switch only ever happens
//! at an explicit suspension point (`sem_down`, CV wait, voluntary yield).

use alloc::boxed::Box;

use bitflags::bitflags;
use spin::Mutex;

use crate::arch::context::{switch_context, ArchThreadContext, ThreadContext};
use crate::sched::smp::current_cpu_id;
use crate::sync::lockfree_queue::LockFreeQueue;

/// Default kernel stack size for a newly allocated kthread.
///
/// Akaros-derived kernels size kthread stacks at a small multiple of the
/// page size; 16KiB is enough for nested syscall handling without being
/// wasteful when thousands of kthreads are parked on wait queues.
pub const KTHREAD_STACK_SIZE: usize = 16 * 1024;

/// Upper bound on concurrently tracked CPUs, mirrors the scheduler's limit.
const MAX_CPUS: usize = 16;

bitflags! {
    /// Kthread flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KthreadFlags: u32 {
        /// This kthread is a ktask (kernel-only background task), never
        /// associated with a process address space.
        const KTASK = 1 << 0;
        /// The address space installed when this kthread last ran must be
        /// restored (rather than reused) on resume.
        const SAVE_ADDR_SPACE = 1 << 1;
    }
}

/// A kernel-owned stack, released exactly once when its kthread is retired.
struct KernelStack {
    storage: Box<[u8]>,
}

impl KernelStack {
    fn new(size: usize) -> Self {
        Self {
            storage: alloc::vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Address one past the end of the stack, i.e. the initial stack
    /// pointer for a downward-growing stack.
    fn top(&self) -> usize {
        self.storage.as_ptr() as usize + self.storage.len()
    }
}

/// An opaque reference to a process, kept alive while a kthread owns it.
///
/// `C3` only needs to know *that* a proc reference exists so the address
/// space can be reinstalled on resume; ownership and reference counting of
/// the actual process object belongs to `C5`/`process`.
pub type ProcRef = usize;

/// An opaque reference to a pending syscall, used by the abort protocol.
pub type SyscallRef = usize;

/// Callback the process/address-space subsystem registers so that resuming
/// a kthread which owns a process reference reinstalls the right page
/// table. Kept as a registration point (rather than a direct call into
/// `process`) so this module has no upward dependency on process lifecycle.
static ADDR_SPACE_INSTALLER: crate::sync::once_lock::OnceLock<fn(ProcRef)> =
    crate::sync::once_lock::OnceLock::new();

/// Register the address-space install hook. Called once during scheduler
/// bring-up.
pub fn set_address_space_installer(installer: fn(ProcRef)) {
    let _ = ADDR_SPACE_INSTALLER.set(installer);
}

/// A kernel execution context: saved register state, its stack, and the
/// bookkeeping needed to resume or retire it.
pub struct Kthread {
    ctx: ArchThreadContext,
    stack: Option<KernelStack>,
    owned_proc: Option<ProcRef>,
    sysc: Option<SyscallRef>,
    flags: KthreadFlags,
}

impl Kthread {
    fn new_ktask() -> Box<Self> {
        Box::new(Self {
            ctx: ArchThreadContext::new(),
            stack: Some(KernelStack::new(KTHREAD_STACK_SIZE)),
            owned_proc: None,
            sysc: None,
            flags: KthreadFlags::KTASK,
        })
    }

    /// Attach a pending syscall reference, used by the abort protocol to
    /// find and flag this kthread's syscall from `abort_sysc`.
    pub fn set_syscall(&mut self, sysc: SyscallRef) {
        self.sysc = Some(sysc);
    }

    pub fn syscall(&self) -> Option<SyscallRef> {
        self.sysc
    }

    pub fn owned_proc(&self) -> Option<ProcRef> {
        self.owned_proc
    }

    pub fn set_owned_proc(&mut self, proc: Option<ProcRef>) {
        self.owned_proc = proc;
        if proc.is_some() {
            self.flags.insert(KthreadFlags::SAVE_ADDR_SPACE);
        }
    }
}

/// Per-CPU spare kthread: the stack we will free from the *next* time this
/// CPU blocks, since we cannot free the stack we are currently running on.
static PER_CPU_SPARE: [Mutex<Option<Box<Kthread>>>; MAX_CPUS] =
    [const { Mutex::new(None) }; MAX_CPUS];

/// Per-CPU queue of kthreads that have become runnable via `kthread_runnable`
/// but have not yet been resumed. Models the "routine kernel message"
/// described for semaphore-up: the waking CPU enqueues a message, and the
/// target CPU drains it the next time it idles or returns from a trap.
/// `LockFreeQueue::new` allocates its sentinel node, so these are built
/// lazily rather than as a `const` array.
struct RoutineQueues {
    queues: [LockFreeQueue<Box<Kthread>>; MAX_CPUS],
}

lazy_static::lazy_static! {
    static ref ROUTINE_QUEUES: RoutineQueues = RoutineQueues {
        queues: core::array::from_fn(|_| LockFreeQueue::new()),
    };
}

/// Mark a blocked kthread runnable by posting it to its target CPU's
/// routine-message queue. The target CPU resumes it the next time it
/// drains routine messages (see [`process_routine_kmsgs`]).
///
/// `target_cpu` is typically the CPU the kthread was blocked on; passing
/// the current CPU is the common case for same-core wakeups.
pub fn kthread_runnable(kthread: Box<Kthread>, target_cpu: u8) {
    let idx = target_cpu as usize % MAX_CPUS;
    ROUTINE_QUEUES.queues[idx].push(kthread);
}

/// Drain and resume every kthread queued as runnable for the current CPU.
///
/// Called from the idle loop / trap-return path. Each resumed kthread
/// runs until it next blocks or returns, at which point control comes
/// back here via the usual stack-swap machinery.
pub fn process_routine_kmsgs() {
    let idx = current_cpu_id() as usize % MAX_CPUS;
    while let Some(target) = ROUTINE_QUEUES.queues[idx].pop() {
        resume(target);
    }
}

/// Swap execution onto `target`, parking the caller's own kthread into the
/// per-CPU spare slot first.
///
/// This implements the stack-swap resumption: (a) park the currently
/// running kthread into the per-CPU spare slot, freeing whatever stack was
/// parked there before (it already had its one chance to be resumed from),
/// (b) install `target` as the CPU's current kthread, (c) reinstall
/// `target`'s address space if it owns one, (d) switch stack/context into
/// it.
fn resume(mut target: Box<Kthread>) {
    let cpu = current_cpu_id() as usize % MAX_CPUS;

    // The caller's kthread for the stack it is currently running on. On a
    // freshly booted CPU there may be no "current" kthread to park yet;
    // in that case we simply switch without recycling a spare.
    if let Some(prev) = current_kthread_take() {
        // The old spare, if any, has already been resumed from once and
        // its stack can now be released; dropping it here frees that
        // stack exactly once, as required.
        let _old_spare = PER_CPU_SPARE[cpu].lock().replace(prev);
    }

    if target.flags.contains(KthreadFlags::SAVE_ADDR_SPACE) {
        if let Some(proc) = target.owned_proc {
            if let Some(installer) = ADDR_SPACE_INSTALLER.get() {
                installer(proc);
            }
        }
    }

    let target_ctx: *const ArchThreadContext = &target.ctx;
    set_current_kthread(target);

    let mut scratch = ArchThreadContext::new();
    // SAFETY: `target_ctx` was either produced by `ThreadContext::init` for
    // a fresh kthread or saved by a prior `block_current` call, so it is a
    // valid, fully initialized context for this architecture; it stays
    // valid across the move into `CURRENT_KTHREAD` above since `Box` never
    // relocates its contents. The caller guarantees interrupts are
    // disabled, matching `switch_context`'s safety contract. `scratch`
    // receives the idle loop's own register state, which is fine to
    // discard: the idle loop is re-entered fresh from
    // `resume_trampoline`/`process_routine_kmsgs` on the next iteration
    // rather than being explicitly resumed.
    unsafe {
        switch_context(&mut scratch, &*target_ctx);
    }
}

/// Per-CPU pointer to the kthread currently executing on this core, used so
/// `resume` can park it before switching away. Populated by
/// `set_current_kthread`, typically called once per CPU at scheduler
/// bring-up and again after every successful resume.
static CURRENT_KTHREAD: [Mutex<Option<Box<Kthread>>>; MAX_CPUS] =
    [const { Mutex::new(None) }; MAX_CPUS];

fn current_kthread_take() -> Option<Box<Kthread>> {
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    CURRENT_KTHREAD[cpu].lock().take()
}

/// Install `kthread` as the one currently executing on this CPU. Must be
/// called immediately after a successful `resume` so the next block
/// operation knows what to park.
pub fn set_current_kthread(kthread: Box<Kthread>) {
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    *CURRENT_KTHREAD[cpu].lock() = Some(kthread);
}

/// Allocate a fresh ktask kthread, or reuse this CPU's spare if one exists.
///
/// Matches the "spare" pattern: a running kthread is about to block, so we
/// need somewhere to continue executing from. Reusing the spare avoids a
/// stack allocation on the common path.
pub fn prepare_blocking_kthread() -> Box<Kthread> {
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    if let Some(spare) = PER_CPU_SPARE[cpu].lock().take() {
        return spare;
    }
    Kthread::new_ktask()
}

/// Action to run as the very first thing on a freshly prepared kthread's
/// stack, before it falls into the idle loop. Boxed so it can be handed off
/// across the context switch via a per-CPU slot.
type OnEntry = Box<dyn FnOnce() + Send>;

/// Per-CPU slot holding the `on_entry` closure for the kthread that is
/// about to start running on this CPU via [`resume_trampoline`].
static PENDING_ON_ENTRY: [Mutex<Option<OnEntry>>; MAX_CPUS] = [const { Mutex::new(None) }; MAX_CPUS];

/// Block the calling context by swapping onto `new_kthread`'s stack.
///
/// `register_waiter` is handed the outgoing (now-parked) kthread and runs
/// on the *new* stack, after the switch but before this CPU does anything
/// else -- mirroring `reset_stack_pointer(new_stacktop, __unlock_and_idle)`:
/// the caller's wait-queue registration and lock release happen only once
/// nothing can be scheduled back onto the stack being vacated. Once
/// `register_waiter` returns, the new kthread falls into
/// [`process_routine_kmsgs`] and then idles.
///
/// This call returns on the *original* stack once some other CPU resumes
/// the parked kthread via [`kthread_runnable`] and [`process_routine_kmsgs`]
/// drains it back in.
///
/// # Safety
/// Must be called with interrupts disabled; `new_kthread`'s stack must not
/// already be in use by another execution context.
pub unsafe fn block_current<F: FnOnce(Box<Kthread>) + Send + 'static>(
    new_kthread: Box<Kthread>,
    register_waiter: F,
) {
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    let stack_top = new_kthread
        .stack
        .as_ref()
        .map(KernelStack::top)
        .unwrap_or(0);

    let mut new_kthread = new_kthread;
    new_kthread
        .ctx
        .init(resume_trampoline as usize, stack_top, stack_top);
    let new_ctx: *const ArchThreadContext = &new_kthread.ctx;

    let mut outgoing = current_kthread_take().unwrap_or_else(Kthread::new_ktask);
    // `outgoing.ctx` is the save slot `switch_context` below fills in with
    // this call site's registers; `resume()` later restores exactly this
    // state by loading `outgoing.ctx` back as its `target`.
    let outgoing_ctx: *mut ArchThreadContext = &mut outgoing.ctx;
    *PENDING_ON_ENTRY[cpu].lock() = Some(Box::new(move || register_waiter(outgoing)));

    set_current_kthread(new_kthread);

    // SAFETY: both pointers are derived from live, heap-allocated `Kthread`
    // boxes that outlive this call (the outgoing box is owned by the
    // closure above; the new box is owned by `CURRENT_KTHREAD`). Interrupts
    // are disabled per this function's contract, so nothing else touches
    // either context concurrently.
    switch_context(&mut *outgoing_ctx, &*new_ctx);
}

/// Entry point for a freshly prepared kthread: run the pending on-entry
/// action (wait-queue registration / lock release), then join the idle
/// loop, draining routine messages forever. Never returns.
extern "C" fn resume_trampoline() -> ! {
    let cpu = current_cpu_id() as usize % MAX_CPUS;
    if let Some(action) = PENDING_ON_ENTRY[cpu].lock().take() {
        action();
    }
    loop {
        process_routine_kmsgs();
        core::hint::spin_loop();
    }
}
