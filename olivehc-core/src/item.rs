//! Item and passby data model (component 4.F's data, design note on the
//! shared fingerprint-node sum type).
//!
//! Grounded on `server.h`'s `ohc_item_s`/`ohc_passby_item_t`: both share a
//! hash-chain header and a 128-bit fingerprint, but an item additionally
//! owns device placement, a length, and reader/writer state, while a
//! passby entry is just the fingerprint, an expiration, and an LRU link.
//! Per `SPEC_FULL.md` §9, this is modeled as an explicit tagged enum
//! rather than an in-place cast over a shared header.

use olivehc_common::Fingerprint;

/// Index into a device's slot table (see `olivehc_common::slot`).
pub type DeviceIndex = u16;
/// Index into a server's slot table.
pub type ServerIndex = u16;

/// A live cached object. Kept intentionally small: the spec calls for
/// "fewer than 64 bytes per item," and every field here is either a fixed
/// scalar or a 16-byte fingerprint — no owned strings or pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub fingerprint: Fingerprint,
    pub server: ServerIndex,
    pub device: DeviceIndex,
    pub offset: u64,
    /// Total stored length: response status line + headers + body.
    pub length: u32,
    pub headers_len: u16,
    pub expire: i64,
    /// Tenant generation this item was written under (see `Server::clear`).
    pub clear: u16,
    pub putting: bool,
    pub deleted: bool,
    pub badblock: bool,
    /// Count of in-flight readers; an item with `used > 0` cannot be freed
    /// even after `deleted` is set (deferred deletion, §9).
    pub used: u16,
}

impl Item {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire <= now
    }

    /// `server_item_valid`: an item is valid only while its device and
    /// server are both live and its generation matches the tenant's
    /// current `clear` counter and it has not expired.
    pub fn is_valid(&self, device_deleted: bool, server_deleted: bool, server_clear: u16, now: i64) -> bool {
        !device_deleted && !server_deleted && self.clear == server_clear && !self.is_expired(now)
    }

    /// An item can be physically freed once no reader holds it and it is
    /// not mid-write.
    pub fn releasable(&self) -> bool {
        self.used == 0 && !self.putting
    }
}

/// A negative-cache entry: "this fingerprint is known to miss often, don't
/// bother storing it yet." Never consumes device space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passby {
    pub fingerprint: Fingerprint,
    pub expire: i64,
}

impl Passby {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire <= now
    }
}

/// What a hash lookup returns: the table stores both kinds of node under
/// one fingerprint-keyed index, tagged so callers never need to downcast
/// through a raw header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEntry<ItemHandle, PassbyHandle> {
    Item(ItemHandle),
    Passby(PassbyHandle),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_is_under_64_bytes() {
        assert!(
            std::mem::size_of::<Item>() < 64,
            "Item grew to {} bytes",
            std::mem::size_of::<Item>()
        );
    }

    #[test]
    fn valid_item_respects_clear_generation() {
        let fp = Fingerprint { low: 1, high: 2 };
        let item = Item {
            fingerprint: fp,
            server: 0,
            device: 0,
            offset: 0,
            length: 10,
            headers_len: 0,
            expire: 1000,
            clear: 1,
            putting: false,
            deleted: false,
            badblock: false,
            used: 0,
        };
        assert!(item.is_valid(false, false, 1, 500));
        assert!(!item.is_valid(false, false, 2, 500), "stale clear generation must invalidate");
        assert!(!item.is_valid(false, false, 1, 2000), "expired item must invalidate");
    }

    #[test]
    fn releasable_respects_readers_and_putting() {
        let fp = Fingerprint { low: 0, high: 0 };
        let mut item = Item {
            fingerprint: fp,
            server: 0,
            device: 0,
            offset: 0,
            length: 0,
            headers_len: 0,
            expire: 0,
            clear: 0,
            putting: true,
            deleted: false,
            badblock: false,
            used: 0,
        };
        assert!(!item.releasable());
        item.putting = false;
        item.used = 1;
        assert!(!item.releasable());
        item.used = 0;
        assert!(item.releasable());
    }
}
