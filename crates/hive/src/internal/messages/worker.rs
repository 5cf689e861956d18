use crate::internal::common::resources::Allocation;
use crate::internal::messages::common::TaskFailInfo;
use crate::internal::worker::configuration::WorkerConfiguration;
use crate::{InstanceId, Priority, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type ChannelId = u32;

pub const STDOUT_CHANNEL: ChannelId = 0;
pub const STDERR_CHANNEL: ChannelId = 1;

#[derive(Serialize, Deserialize, Debug)]
pub struct RegisterWorker {
    pub configuration: WorkerConfiguration,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerRegistrationResponse {
    pub worker_id: WorkerId,
    /// Names of resource kinds, indexed by resource id
    pub resource_names: Vec<String>,
    pub server_idle_timeout: Option<Duration>,
    pub server_uid: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ComputeTaskMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub user_priority: Priority,
    /// Slice of the worker resources reserved for this task
    pub allocation: Allocation,
    pub time_limit: Option<Duration>,
    /// Hostnames of all workers of a multi-node task, rank 0 first; empty otherwise
    pub node_list: Vec<String>,
    /// Peers that have to confirm their reservation before the task may start
    pub mn_peers: Vec<WorkerId>,

    #[serde(with = "serde_bytes")]
    pub body: Box<[u8]>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInstanceMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TaskIdsMsg {
    pub ids: Vec<TaskId>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MnReservationMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub root: WorkerId,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PeerReadyMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub worker_id: WorkerId,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum ToWorkerMessage {
    ComputeTask(ComputeTaskMsg),
    CancelTasks(TaskIdsMsg),
    /// The worker was picked as a non-root node of a multi-node task
    ReserveForTask(MnReservationMsg),
    /// A peer of a multi-node task is ready, delivered to the root node
    PeerReady(PeerReadyMsg),
    /// A multi-node task has ended or was aborted, the peer is free again
    ReleaseReservation(TaskInstanceMsg),
    Stop,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct TaskRunningMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct TaskFailedMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub info: TaskFailInfo,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct TaskOutputMsg {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub channel: ChannelId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// The channel is closed, no more data will follow
    pub eof: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStopReason {
    IdleTimeout,
    TimeLimitReached,
    Interrupted,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum FromWorkerMessage {
    TaskRunning(TaskRunningMsg),
    TaskFinished(TaskInstanceMsg),
    TaskFailed(TaskFailedMsg),
    /// Acknowledgement that a canceled task is no longer running
    TaskCanceled(TaskInstanceMsg),
    /// Reservation of a multi-node peer is in place
    PeerReady(TaskInstanceMsg),
    TaskOutput(TaskOutputMsg),
    Heartbeat,
    Stop(WorkerStopReason),
}
