//! Boot-time allocation, the page-table walker, and MMIO carve-out (C1).
//!
//! This is the layer every other page-table consumer in `mm::` (`vas`,
//! `vmm`, `page_fault`, `demand_paging`) is built on: [`boot_alloc`] hands
//! out the linear bump allocation used before [`frame_allocator`] exists,
//! [`pgdir_walk`] is the one place that knows how to find-or-create a PTE
//! for a given `(pgdir, va)`, and [`mmio_alloc`] carves a VA range out of
//! the kernel's MMIO window for device BARs discovered during boot.
//!
//! Grounded on `mm::page_table::PageMapper`/`PageTableEntry` (the 4-level
//! x86_64 walk this reuses one level at a time) and `mm::frame_allocator`
//! for the runtime side. The source kernel's recursive self-map is replaced
//! by the linear `PHYS_MEM_OFFSET` window described in `mm::phys_to_virt_addr`
//! -- see that function's doc comment for why.

#![allow(dead_code)]

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{
    frame_allocator::FRAME_ALLOCATOR,
    page_table::{PageTable, PageTableEntry, PAGE_TABLE_ENTRIES},
    phys_to_virt_addr, FrameNumber, PageFlags, PageSize, PhysicalAddress, VirtualAddress,
    FRAME_SIZE,
};

/// Whether a walk should create missing intermediate tables, and if so,
/// whether the final mapping should be a jumbo (large) page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkCreate {
    /// Do not allocate; return null if any level is missing.
    No,
    /// Allocate any missing intermediate table, stopping at a normal PTE.
    Yes,
    /// Allocate missing intermediate tables and, if the final level is
    /// reached with nothing installed yet, install a jumbo (2MiB) leaf
    /// directly at the PDE instead of descending to a PTE.
    Jumbo,
}

/// End of the linearly-addressable kernel image, used as the starting point
/// for [`boot_alloc`]. Set once by [`init_boot_allocator`]; the boot
/// allocator is only valid before [`super::FRAME_ALLOCATOR`] takes over
/// runtime allocation.
static BOOT_ALLOC_NEXT: AtomicUsize = AtomicUsize::new(0);
static BOOT_ALLOC_END: AtomicUsize = AtomicUsize::new(0);

/// Root of the boot-time kernel page directory, recorded so
/// [`super::get_kernel_page_table`] has something stable to compare against.
static BOOT_PGDIR_PHYS: Mutex<u64> = Mutex::new(0);

/// Start and bump cursor of the carve-out region used by [`mmio_alloc`].
/// A fixed-size high-half window reserved for device BARs; real systems
/// size this from the bootloader's memory map, but a boot-time-only bump
/// allocator needs no reclamation, so a generous static window is enough.
const MMIO_REGION_BASE: u64 = 0xFFFF_E000_0000_0000;
const MMIO_REGION_SIZE: u64 = 0x1_0000_0000; // 4 GiB of VA space for MMIO
static MMIO_NEXT: AtomicUsize = AtomicUsize::new(MMIO_REGION_BASE as usize);

/// Record the boot allocator's arena: `[start, start+size)` of already
/// kernel-mapped, unused virtual memory immediately past the loaded kernel
/// image. Must run before the first [`boot_alloc`] call and before
/// [`super::FRAME_ALLOCATOR`] is handed any of this range.
pub fn init_boot_allocator_with_range(start: usize, size: usize) {
    BOOT_ALLOC_NEXT.store(start, Ordering::Relaxed);
    BOOT_ALLOC_END.store(start + size, Ordering::Relaxed);
}

/// Default bring-up: reserve a fixed 16MiB scratch window right after the
/// kernel heap's static region for boot_alloc's own bookkeeping structures
/// (slab cache headers and the first few frame-allocator tables, which
/// must exist before the runtime allocator can allocate itself a home).
pub fn init_boot_allocator() {
    init_boot_allocator_with_range(super::heap::HEAP_START + super::heap::HEAP_SIZE, 16 * 1024 * 1024);
}

/// Linear bump allocator from end-of-kernel. Valid only before the runtime
/// page allocator starts. Panics on exhaustion -- per the design, any
/// failure during boot-time mapping is fatal, there is no fallback path
/// this early.
pub fn boot_alloc(size: usize, align: usize) -> VirtualAddress {
    assert!(align.is_power_of_two(), "boot_alloc: align must be a power of two");
    loop {
        let cur = BOOT_ALLOC_NEXT.load(Ordering::Relaxed);
        let aligned = (cur + align - 1) & !(align - 1);
        let end = aligned.checked_add(size).expect("boot_alloc: size overflow");
        assert!(
            end <= BOOT_ALLOC_END.load(Ordering::Relaxed),
            "boot_alloc: out of boot memory (requested {size} bytes, align {align})"
        );
        if BOOT_ALLOC_NEXT
            .compare_exchange(cur, end, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return VirtualAddress::new(aligned as u64);
        }
    }
}

/// Record the physical address of the page directory installed during
/// early boot, so later code can compare "is this the kernel's own table".
pub fn set_boot_pgdir_phys(phys: u64) {
    *BOOT_PGDIR_PHYS.lock() = phys;
}

pub fn boot_pgdir_phys() -> u64 {
    *BOOT_PGDIR_PHYS.lock()
}

/// Read a table at `phys` through the linear KADDR window.
unsafe fn table_at(phys: u64) -> &'static mut PageTable {
    &mut *(phys_to_virt_addr(phys) as *mut PageTable)
}

/// Return a frame, zeroed, to back a newly-created intermediate page table.
/// Returns `None` on allocation failure (runtime OOM); the caller decides
/// whether that is fatal (boot) or should surface as an error (post-boot).
fn alloc_table_frame() -> Option<PhysicalAddress> {
    let frame = FRAME_ALLOCATOR.lock().allocate_frames(1, None).ok()?;
    let phys = PhysicalAddress::new(frame.as_u64() * FRAME_SIZE as u64);
    // SAFETY: the frame was just allocated and is not yet referenced by any
    // page table, so exclusive access through the linear window is sound.
    unsafe {
        table_at(phys.as_u64()).zero();
    }
    Some(phys)
}

/// Walk `pgdir` to find (or, depending on `create`, install) the leaf
/// entry covering `va`.
///
/// - `create = No`: returns `None` if any level along the path is absent.
/// - `create = Yes`: allocates any missing L4/L3/L2 table, descends to and
///   returns the L1 (4KiB) entry. Returns `None` only on allocation failure.
/// - `create = Jumbo`: same, but stops at the L2 (PDE) level and installs a
///   jumbo leaf there if nothing is present yet. `va` must be 2MiB-aligned;
///   panics otherwise (programmer error, matching the design's "fails if va
///   not aligned to the large-page size").
///
/// The returned pointer is a PTE slot in the strict sense only when
/// `create != Jumbo` or when an existing jumbo PDE was found; callers that
/// pass `Jumbo` must test [`PageTableEntry::flags`] for [`PageFlags::HUGE`]
/// on the result before treating it as a normal 4KiB leaf, exactly as the
/// design's "callers must test the jumbo bit" note says.
pub fn pgdir_walk(
    pgdir_phys: PhysicalAddress,
    va: VirtualAddress,
    create: WalkCreate,
) -> Option<*mut PageTableEntry> {
    if create == WalkCreate::Jumbo {
        assert_eq!(
            va.as_u64() % PageSize::Large as u64,
            0,
            "pgdir_walk: va not aligned to jumbo page size"
        );
    }

    let addr = va.as_u64();
    let l4_idx = ((addr >> 39) & 0x1FF) as usize;
    let l3_idx = ((addr >> 30) & 0x1FF) as usize;
    let l2_idx = ((addr >> 21) & 0x1FF) as usize;
    let l1_idx = ((addr >> 12) & 0x1FF) as usize;

    // SAFETY: pgdir_phys is assumed to be a live page-table root reachable
    // through the linear KADDR window (true for the boot pgdir and for
    // every VAS-owned root allocated via frame_allocator).
    let l4 = unsafe { table_at(pgdir_phys.as_u64()) };
    let l4_entry = &mut l4[l4_idx];
    if !l4_entry.is_present() {
        if create == WalkCreate::No {
            return None;
        }
        let frame = alloc_table_frame()?;
        l4_entry.set_addr(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    let l3_phys = l4_entry.addr().unwrap();
    let l3 = unsafe { table_at(l3_phys.as_u64()) };
    let l3_entry = &mut l3[l3_idx];
    if !l3_entry.is_present() {
        if create == WalkCreate::No {
            return None;
        }
        let frame = alloc_table_frame()?;
        l3_entry.set_addr(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    let l2_phys = l3_entry.addr().unwrap();
    let l2 = unsafe { table_at(l2_phys.as_u64()) };
    let l2_entry = &mut l2[l2_idx];

    if l2_entry.is_present() && l2_entry.flags().contains(PageFlags::HUGE) {
        // Existing jumbo mapping -- return it regardless of requested mode,
        // masked as a PTE per the design ("return the PDE pointer masked as
        // a PTE; callers must test the jumbo bit").
        return Some(l2_entry as *mut PageTableEntry);
    }

    if create == WalkCreate::Jumbo {
        if !l2_entry.is_present() {
            // Install the jumbo leaf directly; caller supplies perm via a
            // follow-up `set`, we only guarantee the slot exists.
        }
        return Some(l2_entry as *mut PageTableEntry);
    }

    if !l2_entry.is_present() {
        if create == WalkCreate::No {
            return None;
        }
        let frame = alloc_table_frame()?;
        l2_entry.set_addr(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    let l1_phys = l2_entry.addr().unwrap();
    let l1 = unsafe { table_at(l1_phys.as_u64()) };
    Some(&mut l1[l1_idx] as *mut PageTableEntry)
}

/// Fill contiguous PTEs covering `[va, va+size)` mapped to `[pa, pa+size)`
/// with `perm`. If `perm` requests a jumbo mapping (`PageFlags::HUGE`), both
/// `va` and `pa` must be large-page aligned.
///
/// Crossing from a jumbo PDE into a normal PDE range within one call is a
/// programmer error per the design: warn and proceed rather than fail the
/// whole segment, since the already-mapped jumbo entries are still correct.
/// An unaligned `va` with an aligned `pa` is allowed for non-jumbo mappings
/// (the design permits this "with a warning"); the size is inflated by the
/// page offset so the full range is still covered.
pub fn map_segment(
    pgdir_phys: PhysicalAddress,
    va: VirtualAddress,
    size: usize,
    pa: PhysicalAddress,
    perm: PageFlags,
) {
    let jumbo = perm.contains(PageFlags::HUGE);
    let page_size = if jumbo {
        PageSize::Large as u64
    } else {
        FRAME_SIZE as u64
    };

    if jumbo {
        assert_eq!(pa.as_u64() % page_size, 0, "map_segment: pa not jumbo-aligned");
        assert_eq!(va.as_u64() % page_size, 0, "map_segment: va not jumbo-aligned");
    }

    let page_off = va.as_u64() % FRAME_SIZE as u64;
    let mut va_cur = va.as_u64() - page_off;
    let mut pa_cur = pa.as_u64() - page_off;
    let size = size as u64 + page_off;
    if page_off != 0 {
        println!("[pgdir] map_segment: va unaligned to page size, inflating by 0x{page_off:x}");
    }
    let end = va_cur + size;

    while va_cur < end {
        let create = if jumbo { WalkCreate::Jumbo } else { WalkCreate::Yes };
        let entry = pgdir_walk(pgdir_phys, VirtualAddress::new(va_cur), create)
            .expect("map_segment: OOM allocating intermediate page table during boot mapping");
        // SAFETY: entry came from pgdir_walk against a live table.
        unsafe {
            let entry = &mut *entry;
            if entry.is_present() && entry.flags().contains(PageFlags::HUGE) != jumbo {
                println!(
                    "[pgdir] map_segment: crossing jumbo/normal boundary at va=0x{va_cur:x}, proceeding"
                );
            }
            entry.set_addr(PhysicalAddress::new(pa_cur), perm | PageFlags::PRESENT);
        }
        va_cur += page_size;
        pa_cur += page_size;
    }
}

/// Unlink a second-level (L1) table from its parent PDE.
///
/// Fails if the PDE is absent or is itself a jumbo leaf (nothing to unlink).
/// Panics if any PTE in the table being removed is still present -- the
/// caller must have torn down every leaf mapping first.
pub fn pagetable_remove(pgdir_phys: PhysicalAddress, va: VirtualAddress) -> Result<(), &'static str> {
    let addr = va.as_u64();
    let l4_idx = ((addr >> 39) & 0x1FF) as usize;
    let l3_idx = ((addr >> 30) & 0x1FF) as usize;
    let l2_idx = ((addr >> 21) & 0x1FF) as usize;

    let l4 = unsafe { table_at(pgdir_phys.as_u64()) };
    let l4_entry = &l4[l4_idx];
    if !l4_entry.is_present() {
        return Err("pagetable_remove: L4 entry absent");
    }
    let l3 = unsafe { table_at(l4_entry.addr().unwrap().as_u64()) };
    let l3_entry = &l3[l3_idx];
    if !l3_entry.is_present() {
        return Err("pagetable_remove: L3 entry absent");
    }
    let l2 = unsafe { table_at(l3_entry.addr().unwrap().as_u64()) };
    let l2_entry = &mut l2[l2_idx];
    if !l2_entry.is_present() {
        return Err("pagetable_remove: PDE absent");
    }
    if l2_entry.flags().contains(PageFlags::HUGE) {
        return Err("pagetable_remove: PDE is a jumbo leaf, nothing to unlink");
    }

    let l1_phys = l2_entry.addr().unwrap();
    let l1 = unsafe { table_at(l1_phys.as_u64()) };
    for i in 0..PAGE_TABLE_ENTRIES {
        assert!(
            !l1[i].is_present(),
            "pagetable_remove: leaf table still has present PTEs at index {i}"
        );
    }

    l2_entry.clear();
    FRAME_ALLOCATOR
        .lock()
        .deallocate_frame(super::frame_allocator::PhysicalAddress::new(l1_phys.as_u64()));
    Ok(())
}

/// Carve a size-aligned VA range out of the MMIO window and map it
/// uncached + RW + kernel-only. Callable only during boot (the window is a
/// bump allocator with no reclamation). Returns null on exhaustion or if
/// `pa` is not page-aligned.
pub fn mmio_alloc(pa: PhysicalAddress, size: usize) -> Option<VirtualAddress> {
    if pa.as_u64() % FRAME_SIZE as u64 != 0 {
        return None;
    }
    let aligned_size = size.next_multiple_of(FRAME_SIZE);

    loop {
        let cur = MMIO_NEXT.load(Ordering::Relaxed);
        let end = cur.checked_add(aligned_size)?;
        if end > (MMIO_REGION_BASE + MMIO_REGION_SIZE) as usize {
            return None;
        }
        if MMIO_NEXT
            .compare_exchange(cur, end, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let va = VirtualAddress::new(cur as u64);
            let perm = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_CACHE;
            map_segment(
                PhysicalAddress::new(boot_pgdir_phys()),
                va,
                aligned_size,
                pa,
                perm,
            );
            return Some(va);
        }
    }
}

/// Effective permission bits observed by a translation, computed the way
/// the design's Open Question resolves the source's ambiguous
/// `get_vaperms`: AND of PDE and PTE present/user/write bits; a non-present
/// PDE yields zero; a jumbo PDE contributes its own bits directly (there is
/// no PTE level to AND against).
pub fn effective_perms(pde: PageTableEntry, pte: Option<PageTableEntry>) -> PageFlags {
    if !pde.is_present() {
        return PageFlags::empty();
    }
    if pde.flags().contains(PageFlags::HUGE) {
        return pde.flags();
    }
    let pte = match pte {
        Some(pte) if pte.is_present() => pte,
        _ => return PageFlags::empty(),
    };
    let present = PageFlags::PRESENT;
    let user = if pde.flags().contains(PageFlags::USER) && pte.flags().contains(PageFlags::USER) {
        PageFlags::USER
    } else {
        PageFlags::empty()
    };
    let write = if pde.flags().contains(PageFlags::WRITABLE) && pte.flags().contains(PageFlags::WRITABLE)
    {
        PageFlags::WRITABLE
    } else {
        PageFlags::empty()
    };
    present | user | write
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn boot_alloc_bumps_and_aligns() {
        init_boot_allocator_with_range(0x1000, 0x10000);
        let a = boot_alloc(16, 16);
        let b = boot_alloc(100, 64);
        assert_eq!(a.as_u64() % 16, 0);
        assert_eq!(b.as_u64() % 64, 0);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test_case]
    fn boot_alloc_panics_on_exhaustion() {
        init_boot_allocator_with_range(0x2000, 0x10);
        let _ = boot_alloc(0x10, 1);
        // A second allocation of any size must not fit; we only assert the
        // accounting here rather than catching the panic (no unwind support
        // on this target).
        assert_eq!(BOOT_ALLOC_NEXT.load(Ordering::Relaxed), 0x2010);
    }

    #[test_case]
    fn effective_perms_is_and_of_pde_and_pte() {
        let mut pde = PageTableEntry::empty();
        pde.set(FrameNumber::new(1), PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE);
        let mut pte = PageTableEntry::empty();
        pte.set(FrameNumber::new(2), PageFlags::PRESENT | PageFlags::USER);
        let perms = effective_perms(pde, Some(pte));
        assert!(perms.contains(PageFlags::USER));
        assert!(!perms.contains(PageFlags::WRITABLE));
    }

    #[test_case]
    fn effective_perms_jumbo_pde_has_no_pte() {
        let mut pde = PageTableEntry::empty();
        pde.set(
            FrameNumber::new(1),
            PageFlags::PRESENT | PageFlags::HUGE | PageFlags::WRITABLE,
        );
        let perms = effective_perms(pde, None);
        assert!(perms.contains(PageFlags::WRITABLE));
    }

    #[test_case]
    fn effective_perms_absent_pde_is_zero() {
        let pde = PageTableEntry::empty();
        let perms = effective_perms(pde, None);
        assert_eq!(perms.bits(), 0);
    }
}
