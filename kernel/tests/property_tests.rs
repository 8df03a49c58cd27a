//! Property-style tests for C2/C3/C4's core invariants, run against the
//! hosted build with `proptest` -- the teacher's bare-metal `#[test_case]`
//! suite checks fixed examples; these generate and shrink arbitrary
//! operation sequences to probe the same invariants spec.md §8 calls out:
//! slab conservation, semaphore signal-count coherence, and page-map
//! get/put idempotence.
//!
//! As in `core_properties.rs`, every generated sequence here stays off
//! `Semaphore::down`'s blocking path (by only ever calling `up`/`try_down`,
//! never letting the count go negative) and off `CondVar::wait`, since
//! both perform a real architecture-level context switch that is unsound
//! to drive from a host `std::thread`.

use proptest::prelude::*;

use veridian_kernel::mm::pagemap::{pm_load_page, pm_load_page_nowait, pm_put_page, PageMap, PageMapBackend};
use veridian_kernel::mm::slab::{AllocFlags, KmemCache, PAGE_ARENA};
use veridian_kernel::sync::Semaphore;

#[derive(Debug, Clone, Copy)]
enum SlabOp {
    Alloc,
    Free,
}

fn slab_op_strategy() -> impl Strategy<Value = SlabOp> {
    prop_oneof![Just(SlabOp::Alloc), Just(SlabOp::Free)]
}

proptest! {
    /// Replaying any sequence of alloc/free ops (skipping a `Free` when
    /// nothing is held) must leave `live_objects()` exactly equal to the
    /// number of outstanding allocations a simple model tracks alongside
    /// it, and freeing everything at the end must bring it back to zero.
    #[test]
    fn slab_live_count_matches_model(ops in prop::collection::vec(slab_op_strategy(), 0..200)) {
        let cache = KmemCache::create("property-slab", 32, 8, &PAGE_ARENA, None, None, 0);
        let mut held: Vec<*mut u8> = Vec::new();

        for op in ops {
            match op {
                SlabOp::Alloc => {
                    let obj = cache.alloc(AllocFlags::WAIT).expect("arena has room");
                    held.push(obj);
                }
                SlabOp::Free => {
                    if let Some(obj) = held.pop() {
                        cache.free(obj);
                    }
                }
            }
            prop_assert_eq!(cache.live_objects(), held.len());
        }

        for obj in held {
            cache.free(obj);
        }
        prop_assert_eq!(cache.live_objects(), 0);
    }

    /// A semaphore's count only ever moves along the path a matching
    /// sequence of `up`/`try_down` calls traces out: `n` ups followed by
    /// up to `n` successful try-downs must land back at the starting
    /// count, and no try-down beyond what was up'd may ever succeed.
    #[test]
    fn semaphore_count_matches_up_try_down_model(ups in 0usize..64, extra_downs in 0usize..64) {
        let sem = Semaphore::new(0);
        for _ in 0..ups {
            sem.up();
        }
        prop_assert_eq!(sem.count(), ups as isize);

        let mut succeeded = 0usize;
        for _ in 0..ups + extra_downs {
            if sem.try_down() {
                succeeded += 1;
            }
        }
        prop_assert_eq!(succeeded, ups);
        prop_assert_eq!(sem.count(), 0);
        prop_assert!(!sem.try_down(), "no signal left, try_down must fail rather than go negative");
    }
}

struct AlwaysReady;

impl PageMapBackend for AlwaysReady {
    fn readpage(&self, _index: u64, _frame: veridian_kernel::mm::FrameNumber) -> Result<(), veridian_kernel::error::PageMapError> {
        Ok(())
    }
    fn writepage(&self, _index: u64, _frame: veridian_kernel::mm::FrameNumber) -> Result<(), veridian_kernel::error::PageMapError> {
        Ok(())
    }
}

static ALWAYS_READY: AlwaysReady = AlwaysReady;

proptest! {
    /// An arbitrary number of get/put cycles on one already-resident page
    /// must always succeed (the fast CAS path never wedges) and leave the
    /// page resident and loadable afterwards -- the slot's refcount
    /// round-trips back to its pre-cycle value every time.
    #[test]
    fn pagemap_get_put_cycles_are_idempotent(cycles in 0usize..100) {
        let pm = PageMap::new(&ALWAYS_READY);
        let (_page, slot) = pm_load_page(&pm, 0).expect("backend never fails");
        pm_put_page(&pm, slot);

        for _ in 0..cycles {
            let (_page, slot) = pm_load_page_nowait(&pm, 0).expect("page stays resident");
            pm_put_page(&pm, slot);
        }

        // Still resident and fetchable after any number of cycles.
        let (_page, slot) = pm_load_page_nowait(&pm, 0).expect("page still resident after cycling");
        pm_put_page(&pm, slot);
    }
}
