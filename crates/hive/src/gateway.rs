use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::internal::common::error::DsError;
use crate::internal::worker::configuration::WorkerConfiguration;
use crate::resources::{AllocationRequest, CPU_RESOURCE_NAME, NumOfNodes, ResourceAmount};
use crate::{InstanceId, Map, Priority, TaskId, WorkerId};
use smallvec::{SmallVec, smallvec};
use thin_vec::ThinVec;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRequestEntry {
    pub resource: String,
    pub policy: AllocationRequest,
}

pub type ResourceRequestEntries = SmallVec<[ResourceRequestEntry; 3]>;

/// Resource request as it is submitted by a user, resources are referenced by name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRequest {
    #[serde(default)]
    pub n_nodes: NumOfNodes,

    #[serde(default)]
    pub resources: ResourceRequestEntries,

    #[serde(default)]
    pub min_time: Duration,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        ResourceRequest {
            n_nodes: 0,
            resources: smallvec![ResourceRequestEntry {
                resource: CPU_RESOURCE_NAME.to_string(),
                policy: AllocationRequest::Compact(ResourceAmount::new(1)),
            }],
            min_time: Default::default(),
        }
    }
}

impl ResourceRequest {
    pub fn multi_node(n_nodes: NumOfNodes) -> Self {
        ResourceRequest {
            n_nodes,
            resources: Default::default(),
            min_time: Default::default(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.n_nodes > 0 && !self.resources.is_empty() {
            return Err(DsError::validation(
                "Multi-node tasks reserve whole workers and cannot request individual resources",
            ));
        }
        for (i, entry) in self.resources.iter().enumerate() {
            entry.policy.validate()?;
            for entry2 in &self.resources[i + 1..] {
                if entry.resource == entry2.resource {
                    return Err(DsError::validation(format!(
                        "Resource '{}' defined more than once",
                        entry.resource
                    )));
                }
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
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", entry.resource, entry.policy)?;
        }
        Ok(())
    }
}

/// How many times a task may be started again after a failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximal number of additional instances of a task
    pub max_retries: u32,
    /// Retry also failures of the task itself, not only losses of its worker
    #[serde(default)]
    pub retry_on_failure: bool,
}

pub const DEFAULT_MAX_RETRIES: u32 = 5;

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_on_failure: false,
        }
    }
}

/// Task data that is often shared by multiple tasks.
/// It is sent out-of-band in TaskSubmit to save bandwidth and allocations.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SharedTaskConfiguration {
    pub resources: ResourceRequest,

    #[serde(default)]
    pub time_limit: Option<Duration>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Task data that is unique for each task.
#[derive(Deserialize, Serialize, Debug)]
pub struct TaskConfiguration {
    pub id: TaskId,
    /// Index into TaskSubmit::shared_data that contains the shared data for this task.
    pub shared_data_index: u32,

    pub task_deps: ThinVec<TaskId>,

    /// Opaque data that is passed by the gateway user to task launchers.
    #[serde(with = "serde_bytes")]
    pub body: Box<[u8]>,
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct TaskSubmit {
    pub tasks: Vec<TaskConfiguration>,
    pub shared_data: Vec<SharedTaskConfiguration>,
    /// Restored tasks continue with instance ids above the ones already used
    pub adjust_instance_id: Map<TaskId, InstanceId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum LostWorkerReason {
    Stopped,
    ConnectionLost,
    HeartbeatLost,
    IdleTimeout,
    TimeLimitReached,
}

impl LostWorkerReason {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LostWorkerReason::ConnectionLost | LostWorkerReason::HeartbeatLost
        )
    }
}

impl fmt::Display for LostWorkerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LostWorkerReason::Stopped => "stopped",
            LostWorkerReason::ConnectionLost => "connection lost",
            LostWorkerReason::HeartbeatLost => "heartbeat lost",
            LostWorkerReason::IdleTimeout => "idle timeout",
            LostWorkerReason::TimeLimitReached => "time limit reached",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WorkerRuntimeInfo {
    SingleNodeTasks {
        assigned_tasks: u32,
        running_tasks: u32,
    },
    MultiNodeTask {
        task_id: TaskId,
        main_node: bool,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub configuration: WorkerConfiguration,
    pub runtime: WorkerRuntimeInfo,
}

/// Ready tasks that share the same resource request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BacklogShape {
    pub request: ResourceRequest,
    pub n_tasks: u32,
}

/// Snapshot of the queue state used for allocation hints.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BacklogSummary {
    pub n_waiting: u32,
    pub n_ready: u32,
    pub n_assigned_or_running: u32,
    pub n_workers: u32,
    pub n_idle_workers: u32,
    /// Ready tasks grouped by resource request, largest groups first
    pub shapes: Vec<BacklogShape>,
}
