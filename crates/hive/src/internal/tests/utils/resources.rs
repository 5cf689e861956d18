use crate::internal::common::resources::{
    AllocationRequest, NumOfNodes, ResourceAmount, ResourceId, ResourceRequest,
    ResourceRequestEntries, ResourceRequestEntry,
};
use std::time::Duration;

#[derive(Default, Clone)]
pub struct ResBuilder {
    n_nodes: NumOfNodes,
    resources: ResourceRequestEntries,
    min_time: Duration,
}

impl ResBuilder {
    pub fn add_request(mut self, id: u32, request: AllocationRequest) -> Self {
        self.resources.push(ResourceRequestEntry {
            resource_id: ResourceId::new(id),
            request,
        });
        self
    }

    pub fn add(self, id: u32, amount: u64) -> Self {
        self.add_request(id, AllocationRequest::Compact(ResourceAmount::new(amount)))
    }

    pub fn add_force_compact(self, id: u32, amount: u64) -> Self {
        self.add_request(
            id,
            AllocationRequest::ForceCompact(ResourceAmount::new(amount)),
        )
    }

    pub fn add_scatter(self, id: u32, amount: u64) -> Self {
        self.add_request(id, AllocationRequest::Scatter(ResourceAmount::new(amount)))
    }

    pub fn add_all(self, id: u32) -> Self {
        self.add_request(id, AllocationRequest::All)
    }

    pub fn n_nodes(mut self, n_nodes: NumOfNodes) -> Self {
        self.n_nodes = n_nodes;
        self
    }

    pub fn min_time_secs(mut self, secs: u64) -> Self {
        self.min_time = Duration::from_secs(secs);
        self
    }

    /// Nothing was requested yet (neither resources nor whole nodes)
    pub fn is_empty(&self) -> bool {
        self.n_nodes == 0 && self.resources.is_empty()
    }

    pub fn finish(self) -> ResourceRequest {
        ResourceRequest::new(self.n_nodes, self.min_time, self.resources)
    }
}

pub fn cpus_compact(count: u64) -> ResBuilder {
    ResBuilder::default().add(0, count)
}
