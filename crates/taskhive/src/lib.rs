#![deny(clippy::await_holding_refcell_ref)]

pub mod common;
pub mod server;
pub mod stream;
pub mod transfer;
pub mod worker;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::TaskhiveError;
pub type Result<T> = std::result::Result<T, Error>;

// Reexports
pub use hive;
pub use hive::WrappedRcRefCell;
pub use hive::{InstanceId, JobId, JobTaskCount, JobTaskId, Map, Priority, Set, TaskId, WorkerId};

pub const TASKHIVE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_WORKER_GROUP_NAME: &str = hive::worker::DEFAULT_WORKER_GROUP;
