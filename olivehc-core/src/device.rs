//! Per-device free-space manager, component 4.B.
//!
//! Grounded on `device.c` in full: each device owns a single doubly-linked
//! "order list" interleaving items and free blocks in ascending offset
//! order, plus an [`IpBucket`] size-class index over the free blocks on
//! that list. Coalescing and eviction-to-enlarge both operate purely on
//! order-list neighbors.
//!
//! The device does not know what an "item" is beyond an opaque occupant
//! tag; eviction decisions (is this occupant actively read/written? should
//! it be sacrificed to grow a free block?) are made by the caller (the
//! server/tenant layer) through the `evict` callback passed into
//! [`Device::free_block_extend`] and [`Device::return_free_block`]. This
//! keeps the allocator decoupled from tenant/LRU/hash concerns exactly the
//! way `ipbucket.h`/`device.c` are decoupled from `server.c` in the
//! original, just made explicit instead of implicit in shared globals.

use crate::ipbucket::{quantize, BlockRef, IpBucket};

/// Opaque identifier for whatever occupies a non-free order-list slot.
/// The device never interprets this beyond handing it back to the caller.
pub type OccupantId = u64;

/// Upper bound on a device's capacity so the 40-bit on-disk offset field
/// never overflows. ~270 GiB, per `SPEC_FULL.md`'s supplemented
/// `device_check_270G` directive.
pub const DEVICE_CAPACITY_LIMIT_270G: u64 = 270 * (1u64 << 30);

/// Bound on eviction-cascade iterations inside [`Device::free_block_extend`].
const LOOP_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupant {
    Free,
    Item(OccupantId),
}

struct OrderEntry {
    offset: u64,
    size: u64,
    prev: Option<usize>,
    next: Option<usize>,
    occupant: Occupant,
}

/// What [`Device::free_block_extend`]'s caller-supplied closure should
/// report back about a candidate occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictDecision {
    /// The occupant was evicted; its space can be reclaimed.
    Evicted,
    /// The occupant is actively in use (reader or writer) and must be left
    /// alone (matches `device_delete_item`'s skip of `used`/`putting`
    /// items).
    Busy,
}

pub struct Device {
    pub capacity: u64,
    pub consumed: u64,
    pub badblock: u64,
    pub item_nr: u64,
    pub fblock_nr: u64,
    pub deleted: bool,
    pub kicked: bool,
    order: Vec<Option<OrderEntry>>,
    head: Option<usize>,
    tail: Option<usize>,
    ipbucket: IpBucket,
}

impl Device {
    /// Creates a device whose entire address range starts as one free
    /// block.
    pub fn new(capacity: u64) -> Self {
        let mut order = Vec::new();
        let mut ipbucket = IpBucket::new();
        let mut head = None;
        let mut tail = None;
        if capacity > 0 {
            order.push(Some(OrderEntry {
                offset: 0,
                size: capacity,
                prev: None,
                next: None,
                occupant: Occupant::Free,
            }));
            ipbucket.add(BlockRef(0), capacity);
            head = Some(0);
            tail = Some(0);
        }
        Device {
            capacity,
            consumed: 0,
            badblock: 0,
            item_nr: 0,
            fblock_nr: if capacity > 0 { 1 } else { 0 },
            deleted: false,
            kicked: false,
            order,
            head,
            tail,
            ipbucket,
        }
    }

    /// `device_conf_check`'s capacity guard, supplemented from
    /// `original_source/device.c`'s `device_check_270G` flag.
    pub fn check_capacity(capacity: u64, enforce_270g: bool) -> Result<(), &'static str> {
        if enforce_270g && capacity > DEVICE_CAPACITY_LIMIT_270G {
            return Err("device capacity exceeds the 270G safety limit");
        }
        Ok(())
    }

    /// `get_free_block`: allocate space for an item of `length` bytes.
    /// Splits from the high end of an oversized block to keep low-offset
    /// free space long-lived. Returns the quantized block size and an
    /// opaque order-list key the caller should remember for later release.
    pub fn get_free_block(&mut self, length: u64, occupant: OccupantId) -> Option<(u64, usize)> {
        let bsize = quantize(length);
        let block_key = self.ipbucket.get(bsize)?;
        let idx = block_key.0;
        let entry_size = self.order[idx].as_ref().unwrap().size;

        let item_idx = if entry_size > bsize {
            // Split: carve `bsize` off the high end of the free block.
            let free_offset = self.order[idx].as_ref().unwrap().offset;
            let item_offset = free_offset + (entry_size - bsize);

            self.order[idx].as_mut().unwrap().size = entry_size - bsize;
            self.ipbucket.add(block_key, entry_size - bsize);

            self.insert_after(idx, item_offset, bsize, Occupant::Item(occupant))
        } else {
            // Exact fit: the free block itself becomes the item.
            self.order[idx].as_mut().unwrap().occupant = Occupant::Item(occupant);
            self.fblock_nr -= 1;
            idx
        };

        self.item_nr += 1;
        self.consumed += bsize;
        Some((bsize, item_idx))
    }

    /// `return_free_block`: release an item's space back to the free list,
    /// coalescing with adjacent free neighbors.
    pub fn return_free_block(&mut self, key: usize, length: u64, badblock: bool) {
        let bsize = quantize(length);

        if badblock {
            self.badblock += bsize;
        }

        if self.deleted {
            // The whole order list is being torn down; skip bookkeeping.
            self.item_nr -= 1;
            self.consumed -= bsize;
            return;
        }

        let (prev, next, offset) = {
            let entry = self.order[key].as_ref().unwrap();
            (entry.prev, entry.next, entry.offset)
        };

        let prev_free = prev.and_then(|p| self.free_neighbor(p, offset, true));
        let next_free = next.and_then(|n| self.free_neighbor(n, offset + bsize, false));

        match (prev_free, next_free) {
            (Some(p), Some(n)) => {
                // Both sides merge into `prev`; drop `key` and `next`.
                let p_size = self.order[p].as_ref().unwrap().size;
                let n_size = self.order[n].as_ref().unwrap().size;
                self.order[p].as_mut().unwrap().size = p_size + bsize + n_size;
                self.ipbucket.remove(BlockRef(p), p_size);
                self.ipbucket.remove(BlockRef(n), n_size);
                self.ipbucket.add(BlockRef(p), p_size + bsize + n_size);
                self.unlink(key);
                self.unlink(n);
                self.order[key] = None;
                self.order[n] = None;
                self.fblock_nr -= 1;
            }
            (Some(p), None) => {
                let old_size = self.order[p].as_ref().unwrap().size;
                self.order[p].as_mut().unwrap().size += bsize;
                self.ipbucket.update(BlockRef(p), old_size, old_size + bsize);
                self.unlink(key);
                self.order[key] = None;
            }
            (None, Some(n)) => {
                let old_size = self.order[n].as_ref().unwrap().size;
                let entry_n = self.order[n].as_mut().unwrap();
                entry_n.offset = offset;
                entry_n.size += bsize;
                self.ipbucket.update(BlockRef(n), old_size, old_size + bsize);
                self.unlink(key);
                self.order[key] = None;
            }
            (None, None) => {
                self.order[key].as_mut().unwrap().occupant = Occupant::Free;
                self.ipbucket.add(BlockRef(key), bsize);
                self.fblock_nr += 1;
            }
        }

        self.item_nr -= 1;
        self.consumed -= bsize;
    }

    /// `free_block_extend`: repeatedly evict order-list neighbors until the
    /// biggest free block meets `target`, or give up after `LOOP_LIMIT`
    /// iterations or when the biggest block stops growing.
    pub fn free_block_extend(
        &mut self,
        target: u64,
        mut evict: impl FnMut(OccupantId) -> EvictDecision,
    ) -> Option<usize> {
        let target = quantize(target);
        let mut last_biggest = 0u64;

        for _ in 0..LOOP_LIMIT {
            if let Some(biggest) = self.ipbucket.biggest() {
                let size = self.order[biggest.0].as_ref().unwrap().size;
                if size >= target {
                    return Some(biggest.0);
                }
                if size <= last_biggest {
                    return None;
                }
                last_biggest = size;

                let (prev, next) = {
                    let e = self.order[biggest.0].as_ref().unwrap();
                    (e.prev, e.next)
                };
                for neighbor in [prev, next].into_iter().flatten() {
                    self.try_evict_neighbor(neighbor, &mut evict);
                }
            } else {
                return None;
            }
        }
        None
    }

    /// `cut_free_block`: warm-restart load-time carving of an item at a
    /// known offset out of the device's single remaining tail free block.
    pub fn cut_free_block(&mut self, offset: u64, length: u64, occupant: OccupantId) -> Option<usize> {
        let bsize = quantize(length);
        let tail = self.tail?;
        let (tail_offset, tail_size) = {
            let e = self.order[tail].as_ref().unwrap();
            (e.offset, e.size)
        };
        if !matches!(self.order[tail].as_ref().unwrap().occupant, Occupant::Free) {
            return None;
        }
        if offset < tail_offset || tail_size < (offset - tail_offset) + bsize {
            return None;
        }

        let gap = offset - tail_offset;
        if gap > 0 {
            self.order[tail].as_mut().unwrap().size = gap;
            self.ipbucket.update(BlockRef(tail), tail_size, gap);
            let item_idx = self.insert_after(tail, offset, bsize, Occupant::Item(occupant));
            let remaining = tail_size - gap - bsize;
            if remaining > 0 {
                self.insert_after(item_idx, offset + bsize, remaining, Occupant::Free);
                self.ipbucket.add(BlockRef(self.tail.unwrap()), remaining);
            }
            self.item_nr += 1;
            self.consumed += bsize;
            Some(item_idx)
        } else {
            self.order[tail].as_mut().unwrap().occupant = Occupant::Item(occupant);
            let remaining = tail_size - bsize;
            self.fblock_nr -= 1;
            if remaining > 0 {
                let idx = self.insert_after(tail, offset + bsize, remaining, Occupant::Free);
                self.ipbucket.add(BlockRef(idx), remaining);
            }
            self.item_nr += 1;
            self.consumed += bsize;
            Some(tail)
        }
    }

    /// Finalizes the tail free block after warm-restart loading completes
    /// (`device_load_post`): nothing further to cut, so this is a no-op
    /// hook kept for symmetry with the original's explicit finalize step.
    pub fn load_post(&mut self) {}

    /// Walks the order list in ascending offset order, yielding occupied
    /// items only (used by `format_store_device`).
    pub fn iter_items(&self) -> impl Iterator<Item = (usize, u64, u64, OccupantId)> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || loop {
            let idx = cur?;
            let entry = self.order[idx].as_ref().unwrap();
            cur = entry.next;
            if let Occupant::Item(id) = entry.occupant {
                return Some((idx, entry.offset, entry.size, id));
            }
        })
    }

    fn free_neighbor(&self, idx: usize, expect_offset: u64, is_prev: bool) -> Option<usize> {
        let e = self.order[idx].as_ref()?;
        if !matches!(e.occupant, Occupant::Free) {
            return None;
        }
        let adjacent = if is_prev {
            e.offset + e.size == expect_offset
        } else {
            e.offset == expect_offset
        };
        adjacent.then_some(idx)
    }

    fn try_evict_neighbor(&mut self, idx: usize, evict: &mut impl FnMut(OccupantId) -> EvictDecision) {
        let occupant = match self.order[idx].as_ref() {
            Some(e) => e.occupant,
            None => return,
        };
        if let Occupant::Item(id) = occupant {
            if evict(id) == EvictDecision::Evicted {
                let (offset, size) = {
                    let e = self.order[idx].as_ref().unwrap();
                    (e.offset, e.size)
                };
                self.return_free_block_raw(idx, offset, size);
            }
        }
    }

    /// Internal release path used by eviction, where the caller has
    /// already torn the occupant down and we just need order-list/ipbucket
    /// bookkeeping (no badblock/deleted semantics — those only apply to
    /// the owning request's own release path).
    fn return_free_block_raw(&mut self, key: usize, offset: u64, bsize: u64) {
        let prev = self.order[key].as_ref().unwrap().prev;
        let next = self.order[key].as_ref().unwrap().next;
        let prev_free = prev.and_then(|p| self.free_neighbor(p, offset, true));
        let next_free = next.and_then(|n| self.free_neighbor(n, offset + bsize, false));

        match (prev_free, next_free) {
            (Some(p), Some(n)) => {
                let n_size = self.order[n].as_ref().unwrap().size;
                let p_size = self.order[p].as_ref().unwrap().size;
                self.order[p].as_mut().unwrap().size = p_size + bsize + n_size;
                self.ipbucket.remove(BlockRef(p), p_size);
                self.ipbucket.remove(BlockRef(n), n_size);
                self.ipbucket.add(BlockRef(p), p_size + bsize + n_size);
                self.unlink(key);
                self.unlink(n);
                self.order[key] = None;
                self.order[n] = None;
                self.fblock_nr -= 1;
            }
            (Some(p), None) => {
                let p_size = self.order[p].as_ref().unwrap().size;
                self.order[p].as_mut().unwrap().size = p_size + bsize;
                self.ipbucket.update(BlockRef(p), p_size, p_size + bsize);
                self.unlink(key);
                self.order[key] = None;
            }
            (None, Some(n)) => {
                let n_size = self.order[n].as_ref().unwrap().size;
                let e = self.order[n].as_mut().unwrap();
                e.offset = offset;
                e.size = n_size + bsize;
                self.ipbucket.update(BlockRef(n), n_size, n_size + bsize);
                self.unlink(key);
                self.order[key] = None;
            }
            (None, None) => {
                self.order[key].as_mut().unwrap().occupant = Occupant::Free;
                self.ipbucket.add(BlockRef(key), bsize);
                self.fblock_nr += 1;
            }
        }

        self.item_nr -= 1;
        self.consumed -= bsize;
    }

    fn insert_after(&mut self, after: usize, offset: u64, size: u64, occupant: Occupant) -> usize {
        let next = self.order[after].as_ref().unwrap().next;
        let idx = self.order.len();
        self.order.push(Some(OrderEntry {
            offset,
            size,
            prev: Some(after),
            next,
            occupant,
        }));
        self.order[after].as_mut().unwrap().next = Some(idx);
        match next {
            Some(n) => self.order[n].as_mut().unwrap().prev = Some(idx),
            None => self.tail = Some(idx),
        }
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.order[idx].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.order[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.order[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    /// Invariant check (§8 invariant 1/2): strictly ascending offsets, no
    /// two adjacent free blocks, and `consumed` matches the sum of live
    /// item sizes. Exposed for tests, not used on the hot path.
    #[cfg(test)]
    fn check_invariants(&self) {
        let mut cur = self.head;
        let mut last_end: Option<u64> = None;
        let mut last_was_free = false;
        let mut consumed = 0u64;
        while let Some(idx) = cur {
            let e = self.order[idx].as_ref().unwrap();
            if let Some(end) = last_end {
                assert!(e.offset >= end, "order list must be ascending");
            }
            let is_free = matches!(e.occupant, Occupant::Free);
            assert!(!(is_free && last_was_free), "adjacent free blocks must be merged");
            if !is_free {
                consumed += e.size;
            }
            last_was_free = is_free;
            last_end = Some(e.offset + e.size);
            cur = e.next;
        }
        assert_eq!(consumed, self.consumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_restores_single_block() {
        let mut dev = Device::new(1 << 20);
        let (bsize, key) = dev.get_free_block(1000, 1).unwrap();
        dev.check_invariants();
        dev.return_free_block(key, 1000, false);
        dev.check_invariants();
        assert_eq!(dev.consumed, 0);
        let _ = bsize;
    }

    #[test]
    fn split_allocates_from_high_end() {
        let mut dev = Device::new(1 << 20);
        let (bsize, key) = dev.get_free_block(1000, 1).unwrap();
        let offset = dev.order[key].as_ref().unwrap().offset;
        assert_eq!(offset + bsize, 1 << 20, "split must carve from the high end");
    }

    #[test]
    fn coalesces_both_neighbors_on_release() {
        let mut dev = Device::new(1 << 20);
        let (_, a) = dev.get_free_block(1000, 1).unwrap();
        let (_, b) = dev.get_free_block(1000, 2).unwrap();
        let (_, c) = dev.get_free_block(1000, 3).unwrap();
        dev.return_free_block(a, 1000, false);
        dev.return_free_block(c, 1000, false);
        dev.return_free_block(b, 1000, false);
        dev.check_invariants();
        assert_eq!(dev.consumed, 0);
        assert_eq!(dev.fblock_nr, 1, "all free space must have merged back into one block");
    }

    #[test]
    fn alloc_fails_when_device_is_full() {
        let mut dev = Device::new(1000);
        assert!(dev.get_free_block(1000, 1).is_some());
        assert!(dev.get_free_block(1000, 2).is_none());
    }

    #[test]
    fn free_block_extend_evicts_until_target_met() {
        let mut dev = Device::new(3000);
        let (_, a) = dev.get_free_block(1000, 1).unwrap();
        let (_, _b) = dev.get_free_block(1000, 2).unwrap();
        let (_, c) = dev.get_free_block(1000, 3).unwrap();
        // No free space remains; ask for 2000, evicting a and c should
        // produce a block big enough once coalesced with the (freed)
        // middle... to keep this deterministic, free the middle item first
        // so the extend pass only needs to evict the two ends.
        dev.return_free_block_raw(a, 0, 1000);
        let got = dev.free_block_extend(2000, |_id| EvictDecision::Evicted);
        assert!(got.is_some());
        let _ = c;
    }
}
