//! Linear dynamic hash, component 4.C.
//!
//! Grounded on `utils/hash.c`: fingerprint -> node map with incremental
//! rehashing. Two bucket arrays coexist during an expansion (`buckets` at
//! the new size, `prev_buckets` at the old, half, size); every operation
//! migrates one more `prev_buckets` chain before doing its own work, so no
//! single call pays for a full rehash. Expansion triggers when the average
//! chain length reaches [`HASH_COLLISIONS`], and only when no expansion is
//! already in progress and the table is below [`HASH_BUCKET_SIZE_MAX`].

use olivehc_common::Fingerprint;

/// Matches `HASH_BUCKET_SIZE_BEGIN` in `utils/hash.c`.
const HASH_BUCKET_SIZE_BEGIN: usize = 1 << 4;
/// Matches `HASH_BUCKET_SIZE_MAX`.
const HASH_BUCKET_SIZE_MAX: usize = 1 << 28;
/// Average chain length that triggers a doubling.
const HASH_COLLISIONS: usize = 10;

type Chain<H> = Vec<(Fingerprint, H)>;

/// A fingerprint-keyed hash table with incremental rehashing. `H` is the
/// value stored per entry — typically a [`crate::slab::SlabHandle`] into an
/// items/passby arena, since the hash table itself only needs to route a
/// fingerprint to "where is this thing," not own the thing.
pub struct LinearHash<H> {
    buckets: Vec<Chain<H>>,
    prev_buckets: Option<Vec<Chain<H>>>,
    split: usize,
    items: usize,
}

impl<H: Copy + PartialEq> LinearHash<H> {
    pub fn new() -> Self {
        LinearHash {
            buckets: (0..HASH_BUCKET_SIZE_BEGIN).map(|_| Vec::new()).collect(),
            prev_buckets: None,
            split: 0,
            items: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn insert(&mut self, fp: Fingerprint, handle: H) {
        self.rehash_step();
        let idx = fp.bucket_index(self.buckets.len());
        self.buckets[idx].push((fp, handle));
        self.items += 1;
        self.maybe_expand();
    }

    pub fn get(&self, fp: Fingerprint) -> Option<H> {
        let idx = fp.bucket_index(self.buckets.len());
        if let Some(&(_, h)) = self.buckets[idx].iter().find(|(k, _)| *k == fp) {
            return Some(h);
        }
        if let Some(prev) = &self.prev_buckets {
            let idx = fp.bucket_index(prev.len());
            if let Some(&(_, h)) = prev[idx].iter().find(|(k, _)| *k == fp) {
                return Some(h);
            }
        }
        None
    }

    /// Removes the entry whose fingerprint is `fp` and whose handle equals
    /// `handle` (callers that expect fingerprint collisions across distinct
    /// handles should discriminate this way; practically fingerprints are
    /// effectively unique).
    pub fn remove(&mut self, fp: Fingerprint, handle: H) -> bool {
        self.rehash_step();
        let idx = fp.bucket_index(self.buckets.len());
        if let Some(pos) = self.buckets[idx]
            .iter()
            .position(|(k, h)| *k == fp && *h == handle)
        {
            self.buckets[idx].swap_remove(pos);
            self.items -= 1;
            return true;
        }
        if let Some(prev) = &mut self.prev_buckets {
            let idx = fp.bucket_index(prev.len());
            if let Some(pos) = prev[idx]
                .iter()
                .position(|(k, h)| *k == fp && *h == handle)
            {
                prev[idx].swap_remove(pos);
                self.items -= 1;
                return true;
            }
        }
        false
    }

    /// Moves one bucket's worth of entries from `prev_buckets` into their
    /// new homes in `buckets`. A no-op when no expansion is in progress.
    fn rehash_step(&mut self) {
        let Some(prev) = &mut self.prev_buckets else {
            return;
        };
        let chain = std::mem::take(&mut prev[self.split]);
        let prev_len = prev.len();
        for (fp, handle) in chain {
            let idx = fp.bucket_index(self.buckets.len());
            self.buckets[idx].push((fp, handle));
        }
        self.split += 1;
        if self.split == prev_len {
            self.prev_buckets = None;
            self.split = 0;
        }
    }

    fn maybe_expand(&mut self) {
        if self.prev_buckets.is_some() {
            return;
        }
        if self.buckets.len() >= HASH_BUCKET_SIZE_MAX {
            return;
        }
        if self.items / self.buckets.len() < HASH_COLLISIONS {
            return;
        }
        let old = std::mem::replace(
            &mut self.buckets,
            (0..0).map(|_: usize| Vec::new()).collect(),
        );
        let new_len = old.len() * 2;
        self.buckets = (0..new_len).map(|_| Vec::new()).collect();
        self.prev_buckets = Some(old);
        self.split = 0;
    }
}

impl<H: Copy + PartialEq> Default for LinearHash<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint { low: n, high: n.wrapping_mul(0x9E3779B97F4A7C15) }
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut h: LinearHash<u32> = LinearHash::new();
        h.insert(fp(1), 100);
        assert_eq!(h.get(fp(1)), Some(100));
        assert_eq!(h.get(fp(2)), None);
    }

    #[test]
    fn remove_makes_entry_unreachable() {
        let mut h: LinearHash<u32> = LinearHash::new();
        h.insert(fp(1), 100);
        assert!(h.remove(fp(1), 100));
        assert_eq!(h.get(fp(1)), None);
    }

    #[test]
    fn expansion_preserves_all_entries() {
        let mut h: LinearHash<u64> = LinearHash::new();
        let n = HASH_BUCKET_SIZE_BEGIN * HASH_COLLISIONS * 2;
        for i in 0..n {
            h.insert(fp(i as u64), i as u64);
        }
        assert!(h.buckets.len() > HASH_BUCKET_SIZE_BEGIN, "table should have expanded");
        for i in 0..n {
            assert_eq!(h.get(fp(i as u64)), Some(i as u64));
        }
    }

    #[test]
    fn lookups_work_mid_expansion() {
        let mut h: LinearHash<u64> = LinearHash::new();
        // Drive into an expansion, then immediately look everything up
        // before enough further operations complete the incremental split.
        let n = HASH_BUCKET_SIZE_BEGIN * HASH_COLLISIONS + 1;
        for i in 0..n {
            h.insert(fp(i as u64), i as u64);
        }
        for i in 0..n {
            assert_eq!(h.get(fp(i as u64)), Some(i as u64));
        }
    }
}
