use serde::{Deserialize, Serialize};
use std::fmt;

use crate::internal::common::error::DsError;
use crate::internal::common::resources::{NumOfNodes, ResourceAmount, ResourceId};

use smallvec::SmallVec;
use std::time::Duration;

/// How units of one resource kind should be picked from a worker.
#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq)]
pub enum AllocationRequest {
    /// Any N units, as few topology groups as possible
    Compact(ResourceAmount),
    /// N units from a single topology group; no fallback when no group is big enough
    ForceCompact(ResourceAmount),
    /// Any N units, spread over as many groups as possible
    Scatter(ResourceAmount),
    /// The whole resource of the worker
    All,
}

impl AllocationRequest {
    pub fn validate(&self) -> crate::Result<()> {
        match &self {
            AllocationRequest::Scatter(amount)
            | AllocationRequest::ForceCompact(amount)
            | AllocationRequest::Compact(amount) => {
                if amount.is_zero() {
                    Err(DsError::validation("Zero resources cannot be requested"))
                } else {
                    Ok(())
                }
            }
            AllocationRequest::All => Ok(()),
        }
    }

    pub fn min_amount(&self) -> ResourceAmount {
        match self {
            AllocationRequest::Compact(amount)
            | AllocationRequest::ForceCompact(amount)
            | AllocationRequest::Scatter(amount) => *amount,
            AllocationRequest::All => ResourceAmount::new(1),
        }
    }

    pub fn amount(&self, all: ResourceAmount) -> ResourceAmount {
        match self {
            AllocationRequest::Compact(amount)
            | AllocationRequest::ForceCompact(amount)
            | AllocationRequest::Scatter(amount) => *amount,
            AllocationRequest::All => all,
        }
    }
}

impl fmt::Display for AllocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocationRequest::Compact(amount) => write!(f, "{amount} compact"),
            AllocationRequest::ForceCompact(amount) => write!(f, "{amount} compact!"),
            AllocationRequest::Scatter(amount) => write!(f, "{amount} scatter"),
            AllocationRequest::All => write!(f, "all"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq)]
pub struct ResourceRequestEntry {
    pub resource_id: ResourceId,
    pub request: AllocationRequest,
}

pub type ResourceRequestEntries = SmallVec<[ResourceRequestEntry; 3]>;
pub type TimeRequest = Duration;

/// Resolved resource request of a task (resource names already translated to ids).
#[derive(Default, Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq)]
pub struct ResourceRequest {
    /// Zero for single node tasks, otherwise the number of whole workers
    n_nodes: NumOfNodes,

    resources: ResourceRequestEntries,

    /// Minimal remaining lifetime of a worker needed to START the task.
    /// It is a packing hint, a running task is not stopped when it takes longer;
    /// see time_limit in the task configuration for that.
    #[serde(default)]
    min_time: TimeRequest,
}

impl ResourceRequest {
    pub fn new(
        n_nodes: NumOfNodes,
        min_time: TimeRequest,
        mut resources: ResourceRequestEntries,
    ) -> ResourceRequest {
        resources.sort_unstable_by_key(|r| r.resource_id);
        ResourceRequest {
            n_nodes,
            resources,
            min_time,
        }
    }

    pub fn is_multi_node(&self) -> bool {
        self.n_nodes > 0
    }

    pub fn n_nodes(&self) -> NumOfNodes {
        self.n_nodes
    }

    pub fn min_time(&self) -> TimeRequest {
        self.min_time
    }

    pub fn entries(&self) -> &ResourceRequestEntries {
        &self.resources
    }

    pub fn get(&self, resource_id: ResourceId) -> Option<&AllocationRequest> {
        self.resources
            .iter()
            .find(|e| e.resource_id == resource_id)
            .map(|e| &e.request)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.n_nodes > 0 {
            if !self.resources.is_empty() {
                return Err(DsError::validation(
                    "Multi-node tasks reserve whole workers and cannot request individual resources",
                ));
            }
            return Ok(());
        }
        if self.resources.is_empty() {
            return Err(DsError::validation("Resource request is empty"));
        }
        for entry in &self.resources {
            entry.request.validate()?;
        }
        for pair in self.resources.windows(2) {
            if pair[0].resource_id >= pair[1].resource_id {
                return Err(DsError::validation(
                    "Resource defined more than once in a request",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.n_nodes > 0 {
            return write!(f, "nodes={}", self.n_nodes);
        }
        for (i, entry) in self.resources.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}: {}", entry.resource_id, entry.request)?;
        }
        Ok(())
    }
}
