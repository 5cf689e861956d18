use crate::internal::common::resources::{ResourceAmount, ResourceId, ResourceIndex};
use crate::internal::common::utils::format_comma_delimited;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Concrete slice of one resource kind reserved for a task on a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub resource_id: ResourceId,
    pub amount: ResourceAmount,
    // Empty for sum resources
    pub indices: SmallVec<[ResourceIndex; 4]>,
}

impl ResourceAllocation {
    pub fn comma_delimited_indices(&self) -> String {
        format_comma_delimited(&self.indices)
    }
}

/// All resource slices reserved for a single task on a single worker.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub resources: SmallVec<[ResourceAllocation; 2]>,
}

impl Allocation {
    pub fn new() -> Self {
        Allocation::default()
    }

    pub fn add_resource_allocation(&mut self, ra: ResourceAllocation) {
        self.resources.push(ra);
    }

    pub fn resource_allocation(&self, id: ResourceId) -> Option<&ResourceAllocation> {
        self.resources.iter().find(|r| r.resource_id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn amount(&self, id: ResourceId) -> ResourceAmount {
        self.resource_allocation(id)
            .map(|r| r.amount)
            .unwrap_or(ResourceAmount::ZERO)
    }
}
