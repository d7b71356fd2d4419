//! On-disk format and warm restart, component 4.I.
//!
//! Grounded on `format.c`: a fixed superblock at offset 0 of each device,
//! followed by a port table mapping the tenants that were configured when
//! the store was last saved, followed by one index record per live item.
//! A warm restart validates the superblock, remaps ports back to whatever
//! server config they match this time, and re-inserts each surviving item
//! into its server's hash/LRU and its device's order list via
//! [`crate::device::Device::cut_free_block`]. The magic word is overwritten
//! immediately after a successful load so a crash mid-run never replays a
//! stale snapshot as if it were a clean shutdown.

use olivehc_common::Fingerprint;

/// `OHC_FM_MAGIC` in `format.h`: identifies a valid OliveHC superblock.
pub const MAGIC: u64 = 0x2143_4845_5649_4c4f;
/// Written over `MAGIC` once a load completes, so a second load attempt
/// against the same image (e.g. a double-start) is refused rather than
/// silently repeating warm restart against data the running process has
/// already mutated.
pub const MAGIC_CONSUMED: u64 = u64::from_be_bytes(*b"FeiLiWuS");
/// `OHC_FM_VERSION`.
pub const FORMAT_VERSION: u32 = 1;
/// XOR feed constant the checksum is folded against, matching
/// `OHC_FM_CHS_FEED` in `format.c`.
pub const CHECKSUM_FEED: u64 = 0x57eb_0b4e_ecfe_b465;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub version: u32,
    pub checksum: u64,
    pub ports: Vec<u16>,
    pub item_count: u64,
}

impl Superblock {
    pub fn new(ports: Vec<u16>, item_count: u64) -> Self {
        let mut sb = Superblock {
            magic: MAGIC,
            version: FORMAT_VERSION,
            checksum: 0,
            ports,
            item_count,
        };
        sb.checksum = sb.compute_checksum();
        sb
    }

    /// `format_checksum`: XOR-fold the version, item count and port table
    /// against the feed constant. Order matters (it's a fold, not a
    /// commutative hash), so callers must not reorder `ports` between
    /// writing and validating.
    fn compute_checksum(&self) -> u64 {
        let mut acc = CHECKSUM_FEED ^ self.version as u64 ^ self.item_count;
        for &port in &self.ports {
            acc ^= port as u64;
            acc = acc.rotate_left(7);
        }
        acc
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != MAGIC {
            return Err(FormatError::BadMagic);
        }
        if self.version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(self.version));
        }
        if self.checksum != self.compute_checksum() {
            return Err(FormatError::ChecksumMismatch);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("superblock magic does not match an OliveHC image")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("superblock checksum mismatch")]
    ChecksumMismatch,
    #[error("item index entry references a port not present in the superblock's port table")]
    UnknownPort,
}

/// One index record per stored item, written in device order-list order.
/// `server_dump`-flagged servers (per `SPEC_FULL.md`'s supplemented
/// feature) still get their items written so an operator can restart with
/// that tenant re-populated even though the tenant itself didn't ask for
/// items to be warm-restarted under normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub fingerprint: Fingerprint,
    pub port: u16,
    pub offset: u64,
    pub length: u32,
    pub headers_len: u16,
    pub expire: i64,
}

/// A parsed on-disk image, ready for a caller to replay into live
/// `Device`/`Server` state. Kept as plain data so `format.rs` has no
/// dependency on `device`/`server` and can be unit tested in isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub superblock: Superblock,
    pub records: Vec<IndexRecord>,
}

/// `format_store_device`: serialize a superblock plus every index record a
/// caller hands in (typically produced by walking `Device::iter_items` and
/// resolving each occupant id back to its owning item and port).
pub fn build_image(ports: Vec<u16>, records: Vec<IndexRecord>) -> LoadedImage {
    let superblock = Superblock::new(ports, records.len() as u64);
    LoadedImage { superblock, records }
}

/// `format_load_device`: validate a loaded superblock and drop any index
/// record whose port isn't in `known_ports` (the server was removed from
/// config since the image was written) or whose item has already expired
/// by `now`. Returns the surviving records in their original order, which
/// callers cut into devices oldest-offset-first via `cut_free_block`.
pub fn validate_and_filter(
    image: &LoadedImage,
    known_ports: &[u16],
    now: i64,
) -> Result<Vec<IndexRecord>, FormatError> {
    image.superblock.validate()?;

    let mut surviving = Vec::with_capacity(image.records.len());
    for record in &image.records {
        if !image.superblock.ports.contains(&record.port) {
            return Err(FormatError::UnknownPort);
        }
        if !known_ports.contains(&record.port) {
            continue;
        }
        if record.expire <= now {
            continue;
        }
        surviving.push(*record);
    }
    Ok(surviving)
}

/// Marks a superblock as consumed so a later load of the same bytes is
/// refused. Callers write `superblock.magic` back to the device's
/// reserved header region after this.
pub fn consume(superblock: &mut Superblock) {
    superblock.magic = MAGIC_CONSUMED;
}

/// Flat little-endian byte layout for [`LoadedImage`], written to each
/// device's sidecar index file on clean shutdown. Fixed-width fields only,
/// no varint/tag framing, matching `format.c`'s plain-struct superblock —
/// this port keeps it out of the raw device bytes (see `DESIGN.md`) but
/// the record layout itself still mirrors the original on-disk shape.
pub fn encode(image: &LoadedImage) -> Vec<u8> {
    let sb = &image.superblock;
    let mut out = Vec::with_capacity(32 + sb.ports.len() * 2 + image.records.len() * 42);
    out.extend_from_slice(&sb.magic.to_le_bytes());
    out.extend_from_slice(&sb.version.to_le_bytes());
    out.extend_from_slice(&sb.checksum.to_le_bytes());
    out.extend_from_slice(&sb.item_count.to_le_bytes());
    out.extend_from_slice(&(sb.ports.len() as u32).to_le_bytes());
    for port in &sb.ports {
        out.extend_from_slice(&port.to_le_bytes());
    }
    out.extend_from_slice(&(image.records.len() as u32).to_le_bytes());
    for r in &image.records {
        out.extend_from_slice(&r.fingerprint.low.to_le_bytes());
        out.extend_from_slice(&r.fingerprint.high.to_le_bytes());
        out.extend_from_slice(&r.port.to_le_bytes());
        out.extend_from_slice(&r.offset.to_le_bytes());
        out.extend_from_slice(&r.length.to_le_bytes());
        out.extend_from_slice(&r.headers_len.to_le_bytes());
        out.extend_from_slice(&r.expire.to_le_bytes());
    }
    out
}

/// Inverse of [`encode`]. Returns `None` on any length mismatch; callers
/// treat a malformed or truncated sidecar file the same as "no warm
/// restart data", not a hard startup failure.
pub fn decode(bytes: &[u8]) -> Option<LoadedImage> {
    let mut pos = 0usize;
    let mut take = |n: usize| -> Option<&[u8]> {
        let slice = bytes.get(pos..pos + n)?;
        pos += n;
        Some(slice)
    };

    let magic = u64::from_le_bytes(take(8)?.try_into().ok()?);
    let version = u32::from_le_bytes(take(4)?.try_into().ok()?);
    let checksum = u64::from_le_bytes(take(8)?.try_into().ok()?);
    let item_count = u64::from_le_bytes(take(8)?.try_into().ok()?);
    let port_count = u32::from_le_bytes(take(4)?.try_into().ok()?) as usize;
    let mut ports = Vec::with_capacity(port_count);
    for _ in 0..port_count {
        ports.push(u16::from_le_bytes(take(2)?.try_into().ok()?));
    }
    let record_count = u32::from_le_bytes(take(4)?.try_into().ok()?) as usize;
    let mut records = Vec::with_capacity(record_count);
    for _ in 0..record_count {
        let low = u64::from_le_bytes(take(8)?.try_into().ok()?);
        let high = u64::from_le_bytes(take(8)?.try_into().ok()?);
        let port = u16::from_le_bytes(take(2)?.try_into().ok()?);
        let offset = u64::from_le_bytes(take(8)?.try_into().ok()?);
        let length = u32::from_le_bytes(take(4)?.try_into().ok()?);
        let headers_len = u16::from_le_bytes(take(2)?.try_into().ok()?);
        let expire = i64::from_le_bytes(take(8)?.try_into().ok()?);
        records.push(IndexRecord { fingerprint: Fingerprint { low, high }, port, offset, length, headers_len, expire });
    }

    Some(LoadedImage { superblock: Superblock { magic, version, checksum, ports, item_count }, records })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint { low: n, high: n }
    }

    fn record(port: u16, expire: i64) -> IndexRecord {
        IndexRecord {
            fingerprint: fp(port as u64),
            port,
            offset: 0,
            length: 100,
            headers_len: 20,
            expire,
        }
    }

    #[test]
    fn roundtrip_checksum_validates() {
        let image = build_image(vec![8080], vec![record(8080, 1_000_000)]);
        assert!(image.superblock.validate().is_ok());
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let mut image = build_image(vec![8080], vec![record(8080, 1_000_000)]);
        image.superblock.item_count += 1;
        assert_eq!(image.superblock.validate(), Err(FormatError::ChecksumMismatch));
    }

    #[test]
    fn consumed_magic_refuses_a_second_load() {
        let mut image = build_image(vec![8080], vec![]);
        consume(&mut image.superblock);
        assert_eq!(image.superblock.validate(), Err(FormatError::BadMagic));
    }

    #[test]
    fn filter_drops_unknown_ports_and_expired_items() {
        let image = build_image(
            vec![8080, 9090],
            vec![record(8080, 1_000_000), record(9090, 1_000_000)],
        );
        let surviving = validate_and_filter(&image, &[8080], 0).unwrap();
        assert_eq!(surviving.len(), 1);
        assert_eq!(surviving[0].port, 8080);
    }

    #[test]
    fn filter_drops_items_expired_by_now() {
        let image = build_image(vec![8080], vec![record(8080, 10)]);
        let surviving = validate_and_filter(&image, &[8080], 20).unwrap();
        assert!(surviving.is_empty());
    }

    #[test]
    fn encode_decode_roundtrips() {
        let image = build_image(vec![8080, 9090], vec![record(8080, 1_000_000), record(9090, 2_000_000)]);
        let bytes = encode(&image);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, image);
        assert!(decoded.superblock.validate().is_ok());
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        let image = build_image(vec![8080], vec![record(8080, 1_000_000)]);
        let mut bytes = encode(&image);
        bytes.truncate(bytes.len() - 4);
        assert!(decode(&bytes).is_none());
    }
}
