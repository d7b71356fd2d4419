//! Shared primitives used by every OliveHC crate: request fingerprinting,
//! the index-by-integer slot table, error kinds, and small string helpers.

pub mod error;
pub mod fingerprint;
pub mod slot;
pub mod strutil;

pub use error::OhcError;
pub use fingerprint::Fingerprint;
pub use slot::SlotTable;
