pub(crate) mod comm;
pub mod configuration;
pub(crate) mod reactor;
pub mod rpc;
pub(crate) mod state;
pub(crate) mod task;
