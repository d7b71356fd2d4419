//! Fixed-size object pool ("slab"), component 4.D.
//!
//! Grounded on `utils/slab.c`: one slab per object type, backing blocks
//! sized to hold roughly 128 KiB worth of items (or one block's worth,
//! whichever is smaller), fully-allocated blocks detached from the
//! free-block list until something in them is released, and the first
//! backing block never freed so steady-state traffic doesn't thrash
//! `malloc`/`free` at the block granularity.
//!
//! The C version gets "free needs only the cell's address" by stashing a
//! back-pointer to the owning block just before each cell and doing
//! pointer arithmetic to find it. Rust has no legal equivalent of that
//! trick over a `Vec`, so [`SlabHandle`] carries the block index directly
//! instead — the same O(1) free, expressed as data rather than pointer
//! arithmetic.

/// Backing blocks hold at most this many items (matches the 128 KiB
/// target in `slab_buckets`, minus the per-block bookkeeping, translated
/// to a flat item count instead of a byte budget).
const TARGET_BLOCK_BYTES: usize = 128 * 1024;

/// Opaque handle to a slab-allocated cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabHandle {
    block: usize,
    slot: usize,
}

struct Block<T> {
    cells: Vec<Option<T>>,
    free: Vec<usize>,
}

/// A slab allocator for objects of type `T`.
pub struct Slab<T> {
    blocks: Vec<Option<Block<T>>>,
    has_free: Vec<usize>,
    block_capacity: usize,
    len: usize,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        let size = std::mem::size_of::<T>().max(1);
        let block_capacity = (TARGET_BLOCK_BYTES / size).max(1);
        Slab {
            blocks: Vec::new(),
            has_free: Vec::new(),
            block_capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alloc(&mut self, value: T) -> SlabHandle {
        let block_idx = match self.has_free.last().copied() {
            Some(idx) => idx,
            None => self.grow(),
        };

        let block = self.blocks[block_idx].as_mut().unwrap();
        let slot = block.free.pop().expect("has_free tracks non-empty blocks");
        block.cells[slot] = Some(value);

        if block.free.is_empty() {
            self.has_free.pop();
        }

        self.len += 1;
        SlabHandle {
            block: block_idx,
            slot,
        }
    }

    pub fn free(&mut self, handle: SlabHandle) -> Option<T> {
        let block = self.blocks[handle.block].as_mut()?;
        let value = block.cells[handle.slot].take();
        if value.is_none() {
            return None;
        }
        self.len -= 1;
        let was_full = block.free.is_empty();
        block.free.push(handle.slot);

        if was_full {
            self.has_free.push(handle.block);
        }

        // Never release the first backing block; release any other block
        // once every cell in it has been returned.
        if handle.block != 0 && block.free.len() == self.block_capacity {
            self.blocks[handle.block] = None;
            self.has_free.retain(|&b| b != handle.block);
        }

        value
    }

    pub fn get(&self, handle: SlabHandle) -> Option<&T> {
        self.blocks[handle.block].as_ref()?.cells[handle.slot].as_ref()
    }

    pub fn get_mut(&mut self, handle: SlabHandle) -> Option<&mut T> {
        self.blocks[handle.block].as_mut()?.cells[handle.slot].as_mut()
    }

    /// Iterates every live cell, in block/slot order. Used by warm-restart
    /// dump, not by any hot path.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.blocks
            .iter()
            .filter_map(|b| b.as_ref())
            .flat_map(|b| b.cells.iter())
            .filter_map(|c| c.as_ref())
    }

    fn grow(&mut self) -> usize {
        let mut cells = Vec::with_capacity(self.block_capacity);
        cells.resize_with(self.block_capacity, || None);
        let free = (0..self.block_capacity).rev().collect();
        self.blocks.push(Some(Block { cells, free }));
        let idx = self.blocks.len() - 1;
        self.has_free.push(idx);
        idx
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut slab: Slab<u64> = Slab::new();
        let h = slab.alloc(42);
        assert_eq!(slab.get(h), Some(&42));
        assert_eq!(slab.free(h), Some(42));
        assert_eq!(slab.get(h), None);
    }

    #[test]
    fn first_block_is_never_released() {
        let mut slab: Slab<u8> = Slab::new();
        slab.block_capacity = 4;
        let handles: Vec<_> = (0..4).map(|i| slab.alloc(i)).collect();
        for h in handles {
            slab.free(h);
        }
        // The first block's cells must still be addressable (not torn down).
        let h = slab.alloc(9);
        assert_eq!(h.block, 0);
    }

    #[test]
    fn len_tracks_alloc_and_free() {
        let mut slab: Slab<u32> = Slab::new();
        assert_eq!(slab.len(), 0);
        let a = slab.alloc(1);
        let _b = slab.alloc(2);
        assert_eq!(slab.len(), 2);
        slab.free(a);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn iter_yields_only_live_cells() {
        let mut slab: Slab<u32> = Slab::new();
        let a = slab.alloc(10);
        slab.alloc(20);
        slab.free(a);
        let values: Vec<u32> = slab.iter().copied().collect();
        assert_eq!(values, vec![20]);
    }

    #[test]
    fn full_block_is_detached_until_a_release() {
        let mut slab: Slab<u8> = Slab::new();
        slab.block_capacity = 2;
        let a = slab.alloc(1);
        let _b = slab.alloc(2);
        // block 0 is now full; allocating again must grow a new block.
        let c = slab.alloc(3);
        assert_ne!(a.block, c.block);
    }
}
