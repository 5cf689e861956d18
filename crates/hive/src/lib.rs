#![deny(clippy::await_holding_refcell_ref)]

#[macro_use]
pub mod internal;

pub mod comm;
pub mod control;
pub mod events;
pub mod gateway;
pub mod launcher;
pub mod program;

pub use crate::internal::common::WrappedRcRefCell;
pub use crate::internal::common::index::IdCounter;
pub use crate::internal::common::taskgroup::TaskGroup;
pub use crate::internal::common::utils::format_comma_delimited;
pub use crate::internal::common::{Map, Set};

pub use crate::internal::common::ids::{InstanceId, JobId, JobTaskId, TaskId, WorkerId};

pub type JobTaskCount = u32;

// Priority: Bigger number -> Higher priority
pub type Priority = i32;

pub type Error = internal::common::error::DsError;
pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Version of the worker/server protocol, checked during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

pub mod resources {
    pub use crate::internal::common::resources::{
        AMD_GPU_RESOURCE_NAME, Allocation, AllocationRequest, CPU_RESOURCE_ID, CPU_RESOURCE_NAME,
        GlobalResourceMapping, MEM_RESOURCE_NAME, NVIDIA_GPU_RESOURCE_NAME, NumOfNodes,
        ResourceAllocation, ResourceAmount, ResourceDescriptor, ResourceDescriptorItem,
        ResourceDescriptorKind, ResourceId, ResourceIdMap, ResourceIndex, ResourcePool,
        ResourceRequest, ResourceRequestEntries, ResourceRequestEntry, TimeRequest,
    };
}

pub mod server {
    pub use crate::control::{DEFAULT_LIVENESS_PERIOD, ServerOptions, ServerRef, server_start};
    pub use crate::internal::scheduler::queue::EqualPriorityPolicy;
    pub use crate::internal::server::core::{
        DEFAULT_CANCEL_GRACE, DEFAULT_HEARTBEAT_TIMEOUT, LivenessConfig,
    };
}

pub mod worker {
    pub use crate::internal::messages::worker::{ChannelId, STDERR_CHANNEL, STDOUT_CHANNEL};
    pub use crate::internal::worker::configuration::{
        DEFAULT_MAX_CHUNK_SIZE, DEFAULT_WORKER_GROUP, ServerLostPolicy, WorkerConfiguration,
    };

    pub use crate::internal::worker::rpc::run_worker;
}
