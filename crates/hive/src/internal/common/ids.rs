use crate::define_id_type;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

define_id_type!(JobId, u32);
define_id_type!(JobTaskId, u32);
define_id_type!(WorkerId, u32);
define_id_type!(InstanceId, u32);

/// Identifier of a task, unique only within the job it belongs to.
#[derive(Default, Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId {
    job_id: JobId,
    job_task_id: JobTaskId,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.job_id, self.job_task_id)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, task) = s
            .split_once('@')
            .ok_or_else(|| format!("Invalid task id '{s}', expected format JOB@TASK"))?;
        let job_id = job.parse::<JobId>().map_err(|e| e.to_string())?;
        let job_task_id = task.parse::<JobTaskId>().map_err(|e| e.to_string())?;
        Ok(TaskId::new(job_id, job_task_id))
    }
}

impl TaskId {
    #[inline]
    pub fn new(job_id: JobId, job_task_id: JobTaskId) -> Self {
        Self {
            job_id,
            job_task_id,
        }
    }

    /// Task id in job 0, convenient in tests of the engine
    #[inline]
    pub fn new_test(job_task_id: u32) -> Self {
        Self::new(JobId::new(0), JobTaskId::new(job_task_id))
    }

    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn job_task_id(&self) -> JobTaskId {
        self.job_task_id
    }
}

impl From<u32> for TaskId {
    #[inline]
    fn from(value: u32) -> Self {
        TaskId::new_test(value)
    }
}
