//! Shared error-kind taxonomy, matching the table in spec §7.

use thiserror::Error;

/// Top-level error kinds shared across crates. Per-crate errors
/// (`CoreError`, `ProtoError`, ...) wrap or convert into these where the
/// distinction matters to a caller; most per-request failures are carried
/// as data on the request rather than as a propagated `Result` error (see
/// `SPEC_FULL.md` §4.L).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OhcError {
    #[error("parse error: {0}")]
    Parse(&'static str),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("lookup miss")]
    Lookup,

    #[error("admission declined: {0}")]
    Admission(&'static str),

    #[error("no space available")]
    Capacity,

    #[error("transport error: {0}")]
    Transport(&'static str),

    #[error("disk error: {0}")]
    Disk(&'static str),

    #[error("timeout")]
    Timeout,

    #[error("quitting")]
    Quit,
}
