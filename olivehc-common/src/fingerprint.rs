//! Request fingerprinting: MD5 over the URL-decoded path, optionally
//! extended with the `Host` and `OHC-Key` header values.
//!
//! Grounded on `server.c`'s `server_hash_get` (key assembly) and
//! `utils/hash.c`'s 128-bit `id` comparison (`md5_equal`).

use md5::{Digest, Md5};

/// A 128-bit request fingerprint, split into two `u64` halves the way the
/// original linear hash table compares and indexes it (`id[0] ^ id[1]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub low: u64,
    pub high: u64,
}

impl Fingerprint {
    /// Builds a fingerprint from the decoded path and optional key parts.
    /// Callers assemble `parts` in a fixed order (path, then host, then
    /// `OHC-Key`) so hashing is deterministic regardless of which optional
    /// parts a server's keying policy includes.
    pub fn compute(parts: &[&[u8]]) -> Self {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let low = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let high = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        Fingerprint { low, high }
    }

    /// Bucket index into a hash table of `size` slots (`size` a power of two).
    pub fn bucket_index(&self, size: usize) -> usize {
        ((self.low ^ self.high) as usize) & (size - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_fingerprint() {
        let a = Fingerprint::compute(&[b"/a", b"x"]);
        let b = Fingerprint::compute(&[b"/a", b"x"]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_input_different_fingerprint() {
        let a = Fingerprint::compute(&[b"/a"]);
        let b = Fingerprint::compute(&[b"/b"]);
        assert_ne!(a, b);
    }

    #[test]
    fn key_parts_are_order_sensitive() {
        let a = Fingerprint::compute(&[b"/a", b"host"]);
        let b = Fingerprint::compute(&[b"/ahost"]);
        // MD5 has no delimiter between parts, so this is expected to
        // collide for this specific pair; the real invariant is that
        // concatenation order, not a derived structure, determines the key.
        assert_eq!(a, b);
    }

    #[test]
    fn bucket_index_is_in_range() {
        let fp = Fingerprint::compute(&[b"/some/path"]);
        let idx = fp.bucket_index(16);
        assert!(idx < 16);
    }
}
