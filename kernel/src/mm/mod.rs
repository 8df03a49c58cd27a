//! Memory management: physical/virtual memory bring-up, page tables, the
//! slab/magazine object allocator, the inode page cache, and the virtual
//! address space code that sits on top of them.
//!
//! `mod.rs` only carries the types and glue that are shared across every
//! submodule (the raw address newtypes, `PageFlags`, the kernel's physical
//! memory window) plus the boot-order entry point. Each submodule owns one
//! piece of the substrate:
//!
//! - [`frame_allocator`] -- NUMA-aware bitmap+buddy physical frame allocator.
//! - [`pgdir`] -- boot allocator, page-table walker, MMIO carve-out (C1).
//! - [`slab`] -- `kmem_cache` magazine/depot object allocator (C2).
//! - [`page_table`], [`vas`], [`vmm`] -- per-process page tables and address
//!   spaces, built on `pgdir`'s walker.
//! - [`pagemap`] -- per-file page cache with a lock-free radix tree (C4).
//! - [`heap`] -- the kernel's own `#[global_allocator]`.
//! - [`demand_paging`], [`page_fault`] -- lazy mapping / COW / fault dispatch.
//! - [`bootloader`], [`user_validation`] -- bootloader memory map ingestion,
//!   user pointer validation.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

pub mod bootloader;
pub mod demand_paging;
pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod pagemap;
pub mod pgdir;
pub mod slab;
pub mod user_validation;
pub mod vas;
pub mod vmm;

pub use frame_allocator::{FrameAllocatorError, FrameNumber, PhysicalFrame, FRAME_ALLOCATOR, FRAME_SIZE};
pub use vas::VirtualAddressSpace;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

/// Page size options.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB pages
    Small = 4096,
    /// 2 MiB pages (x86_64) / 2 MiB (AArch64) -- the "jumbo" size in C1.
    Large = 2 * 1024 * 1024,
    /// 1 GiB pages (x86_64) / 1 GiB (AArch64)
    Huge = 1024 * 1024 * 1024,
}

/// The kernel's native page size, used throughout the demand-paging and
/// fault-handling code instead of the more general [`PageSize`] enum.
pub const PAGE_SIZE: usize = FRAME_SIZE;

/// Page table structure (simple owner-of-root-frame placeholder used where
/// callers only need "some page table identity", e.g. capability checks).
/// The real 512-entry hierarchy lives in [`page_table::PageTable`].
pub struct PageTable {
    pub root_phys: PhysicalAddress,
}

/// A single usable/reserved span reported by the bootloader's memory map,
/// reduced to what the frame allocator needs (see [`bootloader`] for the
/// richer [`bootloader::BootloaderMemoryRegion`] this is distilled from).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub usable: bool,
}

/// Page table / mapping permission and cache-control bits.
///
/// Bits 0-8 mirror the hardware x86_64 PTE layout directly so that
/// [`page_table::PageTableEntry::set`] can OR a frame's address straight in;
/// AArch64/RISC-V backends translate the same bits to their own encodings.
/// `EXECUTABLE` (bit 9) is a software-only *request* bit -- callers set it to
/// ask for exec permission, and the arch-specific PTE builder clears
/// `NO_EXECUTE` (the hardware XD/PXN bit) when it sees it set. The two are
/// kept separate rather than folded into one bit because the hardware bit is
/// a *deny* bit (clear = executable) while every other flag here is an
/// *allow* bit, which would make a single shared bit confusing to read at
/// call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(pub u64);

impl PageFlags {
    pub const PRESENT: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const WRITE_THROUGH: Self = Self(1 << 3);
    pub const NO_CACHE: Self = Self(1 << 4);
    pub const ACCESSED: Self = Self(1 << 5);
    pub const DIRTY: Self = Self(1 << 6);
    pub const HUGE: Self = Self(1 << 7);
    pub const GLOBAL: Self = Self(1 << 8);
    pub const EXECUTABLE: Self = Self(1 << 9);
    pub const NO_EXECUTE: Self = Self(1 << 63);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for PageFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

/// Offset added to a physical address to reach the kernel's linear mapping
/// of all of physical RAM.
///
/// The source kernel this is modeled on installs a recursive self-map: one
/// page-directory entry points the PDE back at itself so the CPU can be
/// asked, via a fixed virtual address range, to read its own page tables.
/// This codebase's boot protocol (`bootloader_api`, see `arch::x86_64::boot`)
/// instead hands the kernel a single contiguous "physical memory offset" at
/// boot and maps all of RAM there up front -- functionally the same
/// capability (turn a PA that came out of a PTE into something the kernel
/// can dereference) without needing a second, kernel-only PDE slot. `pgdir`
/// builds its walker on top of this offset rather than reimplementing a
/// literal self-map.
static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the kernel's physical memory window, as discovered from the
/// bootloader's `BootInfo` during stage 2 bring-up. Idempotent; later calls
/// overwrite earlier ones (this only ever runs once, before SMP starts).
pub fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, Ordering::Release);
}

pub fn phys_mem_offset() -> u64 {
    PHYS_MEM_OFFSET.load(Ordering::Acquire)
}

/// Translate a physical address into the kernel's linear mapping of RAM.
///
/// This is this kernel's `KADDR`: every walker in [`pgdir`] and every
/// consumer that needs to read a page table, page, or DMA buffer by physical
/// address goes through here.
pub fn phys_to_virt_addr(phys: u64) -> u64 {
    phys + PHYS_MEM_OFFSET.load(Ordering::Acquire)
}

/// Inverse of [`phys_to_virt_addr`] for addresses known to fall inside the
/// linear physical-memory window (as opposed to a process's own mappings).
pub fn virt_to_phys_addr(virt: u64) -> u64 {
    virt - PHYS_MEM_OFFSET.load(Ordering::Acquire)
}

/// Allocate `count` contiguous physical pages from the runtime frame
/// allocator. Thin wrapper so driver code doesn't need to reach into
/// `frame_allocator` directly -- matches the exposed-interface surface in
/// the design (`page_alloc`).
pub fn allocate_pages(
    count: usize,
    numa_node: Option<usize>,
) -> Result<FrameNumber, FrameAllocatorError> {
    FRAME_ALLOCATOR.lock().allocate_frames(count, numa_node)
}

/// Free a single physical frame, identified by its physical address.
pub fn free_frame(addr: PhysicalAddress) {
    FRAME_ALLOCATOR
        .lock()
        .deallocate_frame(frame_allocator::PhysicalAddress::new(addr.as_u64()));
}

/// Snapshot frame-allocator statistics (total/free frames, allocation
/// counts) for `/proc`-style introspection and the desktop's resource
/// monitor.
pub fn get_memory_stats() -> frame_allocator::FrameAllocatorStats {
    FRAME_ALLOCATOR.lock().get_stats()
}

/// Physical address of the boot-time kernel page table root, for code that
/// needs to compare a process's page table against "the kernel's own".
pub fn get_kernel_page_table() -> *const PageTable {
    pgdir::boot_pgdir_phys() as *const PageTable
}

/// Bring up C1 (physical memory + page tables) in the fixed order the rest
/// of boot depends on: the frame allocator and heap must both be live
/// before C2's slab caches can be bootstrapped, which in turn must be live
/// before C3's kthread cache or C4's page-map bufctls can allocate anything.
///
/// Called once from [`crate::bootstrap::kernel_init`] during stage 2.
pub fn init_default() {
    println!("[MM] Initializing memory management...");

    pgdir::init_boot_allocator();

    if let Err(e) = heap::init() {
        println!("[MM] WARNING: heap init failed: {e}");
    }

    slab::init();
    demand_paging::init();

    println!("[MM] Memory management initialized");
}

/// Legacy entry point kept for callers that only want frame allocator +
/// heap bring-up without the rest of [`init_default`]'s subsystem chain
/// (e.g. unit tests that construct their own page tables).
#[allow(dead_code)]
pub fn init() {
    init_default();
}
