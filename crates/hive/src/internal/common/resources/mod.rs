pub mod allocation;
pub mod amount;
pub mod descriptor;
pub mod map;
pub mod pool;
pub mod request;

use crate::define_id_type;
pub use allocation::{Allocation, ResourceAllocation};
pub use amount::ResourceAmount;
pub use descriptor::{ResourceDescriptor, ResourceDescriptorItem, ResourceDescriptorKind};
pub use map::{
    AMD_GPU_RESOURCE_NAME, CPU_RESOURCE_ID, CPU_RESOURCE_NAME, GlobalResourceMapping,
    MEM_RESOURCE_NAME, NVIDIA_GPU_RESOURCE_NAME, ResourceIdMap,
};
pub use pool::ResourcePool;
pub use request::{
    AllocationRequest, ResourceRequest, ResourceRequestEntries, ResourceRequestEntry, TimeRequest,
};

pub type NumOfNodes = u32;

// Identifies a resource kind (e.g. "cpus" or "gpus/nvidia"), globally within a server
define_id_type!(ResourceId, u32);

// Represents an index within a single indexed resource (e.g. GPU with ID 1)
define_id_type!(ResourceIndex, u32);
