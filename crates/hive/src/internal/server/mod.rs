pub mod client;
pub mod comm;
pub mod core;
pub mod liveness;
pub mod reactor;
pub mod retry;
pub mod rpc;
pub mod task;
pub mod taskmap;
pub mod worker;
pub mod workergroup;
pub mod workermap;
