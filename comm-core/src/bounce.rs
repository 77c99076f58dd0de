//! Bounce buffers. `spec.md` §4.3: "staging copies when an address isn't
//! network-registerable." `rdma.rs`/`amo.rs` reach for one whenever
//! `mr.mr_get_desc` misses on a local operand — a user buffer that lives
//! outside the registered heap (stack, a `Vec` never handed to the
//! allocator, etc).
//!
//! Slots are CAS-allocated the same way [`crate::tcx::TcxTable`] allocates
//! contexts; there's no `bound` concept here since a bounce buffer is
//! always released at the end of the single operation that needed it.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::heap::HeapRegion;
use crate::task::Tasking;

/// A fixed-capacity pool of `slot_size`-byte scratch buffers carved out of
/// a sub-range of the node's own registered heap (not a separate
/// allocation) — the pool's slots must live inside the one MR the fabric
/// knows how to address, the same way the order-dummy word does
/// (`mcm.rs`). `slot_size` should cover the largest staged transfer the
/// caller expects (`rdma.rs` uses it for buffered PUTs up to
/// `MAX_UNORDERED_TRANS_SZ`; `amo.rs` only ever needs one word).
pub struct BouncePool {
    heap: HeapRegion,
    base_offset: u64,
    slot_size: usize,
    allocated: Vec<AtomicBool>,
}

impl BouncePool {
    /// `base_offset..base_offset + slot_size*slot_count` must lie within
    /// `heap` and must be a range `init.rs` never hands out as ordinary
    /// user heap.
    pub fn carve(heap: HeapRegion, base_offset: u64, slot_size: usize, slot_count: usize) -> BouncePool {
        assert!(slot_size > 0 && slot_count > 0, "bounce pool must have at least one nonempty slot");
        assert!(
            heap.contains(base_offset, slot_size * slot_count),
            "bounce region [{base_offset}, {}) does not fit the backing heap",
            base_offset as usize + slot_size * slot_count
        );
        BouncePool {
            heap,
            base_offset,
            slot_size,
            allocated: (0..slot_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Byte span `init.rs` must reserve for a pool of this shape before
    /// handing the remainder of the heap out as ordinary PGAS memory.
    pub const fn region_size(slot_size: usize, slot_count: usize) -> usize {
        slot_size * slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.allocated.len()
    }

    /// Claims a free slot, spin-yielding if the pool is momentarily
    /// exhausted — mirrors `tci_alloc`'s retry loop, just without a bound
    /// fast path since nothing here is ever pinned.
    pub fn acquire(&self, tasking: &dyn Tasking) -> BounceLease<'_> {
        loop {
            for (index, flag) in self.allocated.iter().enumerate() {
                if flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    return BounceLease { pool: self, index };
                }
            }
            tasking.task_yield();
        }
    }
}

/// A claimed slot. [`BounceLease::offset`] is an absolute offset into the
/// node's registered heap, suitable for `mr.own_remote_key`/`mr_get_key`
/// lookups directly.
pub struct BounceLease<'a> {
    pool: &'a BouncePool,
    index: usize,
}

impl BounceLease<'_> {
    pub fn offset(&self) -> u64 {
        self.pool.base_offset + (self.index * self.pool.slot_size) as u64
    }

    pub fn copy_in(&self, src: &[u8]) {
        assert!(src.len() <= self.pool.slot_size, "staged transfer exceeds bounce slot size");
        self.pool.heap.slice_mut(self.offset(), src.len()).copy_from_slice(src);
    }

    pub fn copy_out(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.pool.slot_size, "staged transfer exceeds bounce slot size");
        dst.copy_from_slice(self.pool.heap.slice(self.offset(), dst.len()));
    }
}

impl Drop for BounceLease<'_> {
    fn drop(&mut self) {
        self.pool.allocated[self.index].store(false, Ordering::Release);
    }
}

impl BouncePool {
    /// Manual release counterpart to `BounceLease`'s `Drop`, for the one
    /// case in this crate where RAII doesn't fit: a delayed blocking AM's
    /// done-flag slot outlives the call that allocated it, surviving in
    /// `TaskPrivate` across an arbitrary number of `task_yield`s until
    /// `am::request::retire_delayed_done` reads and releases it
    /// (`spec.md` §4.6's "Delayed blocking AM").
    pub fn release_by_offset(&self, offset: u64) {
        let index = ((offset - self.base_offset) / self.slot_size as u64) as usize;
        self.allocated[index].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ThreadTasking;

    #[test]
    fn copy_in_then_out_roundtrips() {
        let heap = HeapRegion::leaked(BouncePool::region_size(64, 2));
        let pool = BouncePool::carve(heap, 0, 64, 2);
        let tasking = ThreadTasking::new(1, 1);
        let lease = pool.acquire(&tasking);
        lease.copy_in(b"hello bounce");
        let mut out = [0u8; 12];
        lease.copy_out(&mut out);
        assert_eq!(&out, b"hello bounce");
    }

    #[test]
    fn slots_are_reused_after_drop() {
        let heap = HeapRegion::leaked(BouncePool::region_size(8, 1));
        let pool = BouncePool::carve(heap, 0, 8, 1);
        let tasking = ThreadTasking::new(1, 1);
        let idx = {
            let lease = pool.acquire(&tasking);
            lease.index
        };
        let lease2 = pool.acquire(&tasking);
        assert_eq!(lease2.index, idx);
    }

    #[test]
    fn distinct_slots_do_not_alias() {
        let heap = HeapRegion::leaked(BouncePool::region_size(8, 2));
        let pool = BouncePool::carve(heap, 0, 8, 2);
        let tasking = ThreadTasking::new(1, 1);
        let a = pool.acquire(&tasking);
        let b = pool.acquire(&tasking);
        a.copy_in(&[1u8; 8]);
        b.copy_in(&[2u8; 8]);
        let mut out_a = [0u8; 8];
        let mut out_b = [0u8; 8];
        a.copy_out(&mut out_a);
        b.copy_out(&mut out_b);
        assert_eq!(out_a, [1u8; 8]);
        assert_eq!(out_b, [2u8; 8]);
    }
}
