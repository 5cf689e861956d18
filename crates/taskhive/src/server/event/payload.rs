use hive::gateway::LostWorkerReason;
use hive::worker::WorkerConfiguration;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::serialization::Serialized;
use crate::transfer::messages::{JobSpec, SubmitRequest};
use crate::{InstanceId, JobId, JobTaskId, WorkerId};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum EventPayload {
    ServerStart {
        server_uid: String,
    },
    ServerStop,
    /// New worker has connected to the server
    WorkerConnected(WorkerId, Box<WorkerConfiguration>),
    /// Worker has disconnected from the server
    WorkerLost(WorkerId, LostWorkerReason),
    /// Tasks were added to a job; enough to rebuild them during restore
    Submit {
        job_id: JobId,
        closed_job: bool,
        serialized_desc: Serialized<SubmitRequest>,
    },
    JobOpen(JobId, JobSpec),
    JobClose(JobId),
    /// All tasks of the job have ended
    JobCompleted(JobId),
    JobForgotten(JobId),
    /// Task has started to execute on some worker
    TaskStarted {
        job_id: JobId,
        task_id: JobTaskId,
        instance_id: InstanceId,
        workers: SmallVec<[WorkerId; 1]>,
    },
    TaskFinished {
        job_id: JobId,
        task_id: JobTaskId,
    },
    TaskFailed {
        job_id: JobId,
        task_id: JobTaskId,
        error: String,
    },
    TaskCanceled {
        job_id: JobId,
        task_id: JobTaskId,
    },
}
