use std::fmt;
use std::time::Duration;

use bstr::BString;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;

use hive::gateway::{LostWorkerReason, ResourceRequest, RetryPolicy, WorkerRuntimeInfo};
use hive::program::ProgramDefinition;
use hive::worker::{ChannelId, WorkerConfiguration};

use crate::common::arraydef::IntArray;
use crate::server::job::JobTaskCounters;
use crate::{InstanceId, JobId, JobTaskCount, JobTaskId, Priority, WorkerId};

// Messages client -> server
#[allow(clippy::large_enum_variant)]
#[derive(Serialize, Deserialize, Debug)]
pub enum FromClientMessage {
    Submit(SubmitRequest),
    OpenJob(OpenJobRequest),
    CloseJob(CloseJobRequest),
    JobInfo(JobInfoRequest),
    JobList(JobListRequest),
    TaskList(TaskListRequest),
    Cancel(CancelRequest),
    WaitForJobs(WaitForJobsRequest),
    ForgetJob(ForgetJobRequest),
    StreamAttach(StreamAttachRequest),
    WorkerList,
    StopWorker(StopWorkerRequest),
    ServerDump,
    Stop,
}

/// What a worker receives as the opaque body of a task
#[derive(Serialize, Deserialize, Debug)]
pub struct TaskBody {
    pub program: ProgramDefinition,
    /// Create a scratch directory for the task, removed when the task ends
    pub task_dir: bool,
    pub entry: Option<BString>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskDescription {
    pub program: ProgramDefinition,
    pub resources: ResourceRequest,
    pub task_dir: bool,
    pub time_limit: Option<Duration>,
    pub priority: Priority,
    pub retry: RetryPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskWithDependencies {
    pub id: JobTaskId,
    pub task_desc: TaskDescription,
    pub dependencies: Vec<JobTaskId>,
}

#[allow(clippy::large_enum_variant)]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum JobDescription {
    /// One template instantiated for each id of the array
    Array {
        ids: IntArray,
        entries: Option<Vec<BString>>,
        task_desc: TaskDescription,
    },
    /// Explicit tasks with dependencies inside the job
    Graph { tasks: Vec<TaskWithDependencies> },
}

impl JobDescription {
    pub fn task_count(&self) -> JobTaskCount {
        match self {
            JobDescription::Array { ids, .. } => ids.id_count() as JobTaskCount,
            JobDescription::Graph { tasks } => tasks.len() as JobTaskCount,
        }
    }
}

/// How the state of a job reacts to failed tasks
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The job is reported as failed as soon as one of its tasks fails
    #[default]
    Fail,
    /// The job keeps running after a failure and is reported as failed once all of
    /// its tasks ended
    Continue,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    /// Remaining tasks are canceled once more than this many tasks failed
    pub max_fails: Option<JobTaskCount>,
    pub failure_policy: FailurePolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitRequest {
    pub spec: JobSpec,
    pub job_desc: JobDescription,
    /// Attach tasks to an existing open job instead of creating a new one
    pub job_id: Option<JobId>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct OpenJobRequest {
    pub spec: JobSpec,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CloseJobRequest {
    pub selector: IdSelector,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum IdSelector {
    All,
    LastN(u32),
    Specific(IntArray),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JobInfoRequest {
    pub selector: IdSelector,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct JobListRequest {
    /// Empty filter selects jobs in all states
    pub status: Vec<JobStatus>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TaskListRequest {
    pub job_id: JobId,
    /// Empty filter selects tasks in all states
    pub status: Vec<TaskStatus>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CancelRequest {
    pub selector: IdSelector,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WaitForJobsRequest {
    pub selector: IdSelector,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ForgetJobRequest {
    pub selector: IdSelector,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StreamAttachRequest {
    pub job_id: JobId,
    pub task_id: JobTaskId,
    /// Latest instance of the task when missing
    pub instance_id: Option<InstanceId>,
    pub channel: ChannelId,
    /// Byte offset from which the output is wanted
    pub offset: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StopWorkerRequest {
    pub selector: IdSelector,
}

// Messages server -> client
#[allow(clippy::large_enum_variant)]
#[derive(Serialize, Deserialize, Debug)]
pub enum ToClientMessage {
    SubmitResponse(SubmitResponse),
    OpenJobResponse(JobId),
    CloseJobResponse(Vec<(JobId, CloseJobResponse)>),
    JobInfoResponse(JobInfoResponse),
    JobListResponse(JobInfoResponse),
    TaskListResponse(TaskListResponse),
    CancelJobResponse(Vec<(JobId, CancelJobResponse)>),
    WaitForJobsResponse(WaitForJobsResponse),
    ForgetJobResponse(ForgetJobResponse),
    StreamEvent(StreamEvent),
    WorkerListResponse(WorkerListResponse),
    StopWorkerResponse(Vec<(WorkerId, StopWorkerResponse)>),
    /// JSON encoded overview of the engine
    ServerDump(String),
    Error(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub n_tasks: JobTaskCount,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CloseJobResponse {
    Closed,
    AlreadyClosed,
    InvalidJob,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CancelJobResponse {
    Canceled(Vec<JobTaskId>, JobTaskCount),
    InvalidJob,
    Failed(String),
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct WaitForJobsResponse {
    pub finished: u32,
    pub failed: u32,
    pub canceled: u32,
    pub invalid: u32,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct ForgetJobResponse {
    pub forgotten: u32,
    /// Jobs that are still running cannot be forgotten
    pub ignored: u32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum StopWorkerResponse {
    Stopped,
    AlreadyStopped,
    InvalidWorker,
    Failed(String),
}

/// Aggregate state of a job
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Submitted,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Some dependencies did not finish yet
    Waiting,
    /// Waits in the queue for free resources
    Ready,
    /// Bound to worker(s) that did not report its start yet
    Assigned,
    Running,
    Finished,
    Failed,
    Canceled,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub n_tasks: JobTaskCount,
    pub counters: JobTaskCounters,
    pub is_open: bool,
    pub max_fails: Option<JobTaskCount>,
    pub submission_date: DateTime<Utc>,
    pub completion_date: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JobInfoResponse {
    pub jobs: Vec<JobInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskInfo {
    pub id: JobTaskId,
    pub status: TaskStatus,
    pub instance_id: Option<InstanceId>,
    pub workers: SmallVec<[WorkerId; 1]>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TaskListResponse {
    pub job_id: JobId,
    pub tasks: Vec<TaskInfo>,
}

/// One message of an output attach session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data {
        offset: u64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Bytes in `[from, to)` were evicted from the retention buffer before they were read
    Gap { from: u64, to: u64 },
    /// The channel is closed, `offset` is its final length
    Eof { offset: u64 },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerExitInfo {
    pub ended_at: DateTime<Utc>,
    pub reason: LostWorkerReason,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub configuration: WorkerConfiguration,
    pub started: DateTime<Utc>,
    pub ended: Option<WorkerExitInfo>,
    /// Present for connected workers only
    pub runtime: Option<WorkerRuntimeInfo>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerInfo>,
}
