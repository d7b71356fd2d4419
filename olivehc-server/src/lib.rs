//! Socket-facing half of OliveHC: the per-connection request state
//! machine, the disk-facing worker pool, and the master event loop tying
//! them together.

pub mod master;
pub mod request;
pub mod worker;

pub use master::{AdminCommand, DeviceEntry, Master, MasterConfig};
pub use request::{Phase, Request};
pub use worker::{DiskJob, DiskOp, DiskResult, WorkerPool};
