use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::common::error::TaskhiveError;
use crate::transfer::messages::{
    FailurePolicy, JobInfo, JobSpec, JobStatus, TaskInfo, TaskStatus,
};
use crate::{InstanceId, JobId, JobTaskCount, JobTaskId, Map, TaskId, WorkerId};

/// State of a task that has been started at least once.
/// It contains the last known state of the task.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartedTaskData {
    pub start_date: DateTime<Utc>,
    pub instance_id: InstanceId,
    pub worker_ids: SmallVec<[WorkerId; 1]>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum JobTaskState {
    Waiting,
    Ready,
    Assigned {
        instance_id: InstanceId,
        worker_ids: SmallVec<[WorkerId; 1]>,
    },
    Running {
        started_data: StartedTaskData,
    },
    Finished {
        started_data: StartedTaskData,
        end_date: DateTime<Utc>,
    },
    Failed {
        /// Missing when the task could not be launched at all
        started_data: Option<StartedTaskData>,
        end_date: DateTime<Utc>,
        error: String,
    },
    Canceled {
        started_data: Option<StartedTaskData>,
        cancelled_date: DateTime<Utc>,
    },
}

impl JobTaskState {
    pub fn started_data(&self) -> Option<&StartedTaskData> {
        match self {
            JobTaskState::Running { started_data, .. }
            | JobTaskState::Finished { started_data, .. } => Some(started_data),
            JobTaskState::Failed { started_data, .. }
            | JobTaskState::Canceled { started_data, .. } => started_data.as_ref(),
            JobTaskState::Waiting | JobTaskState::Ready | JobTaskState::Assigned { .. } => None,
        }
    }

    /// Instance that was assigned or started most recently
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            JobTaskState::Assigned { instance_id, .. } => Some(*instance_id),
            state => state.started_data().map(|data| data.instance_id),
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            JobTaskState::Waiting => TaskStatus::Waiting,
            JobTaskState::Ready => TaskStatus::Ready,
            JobTaskState::Assigned { .. } => TaskStatus::Assigned,
            JobTaskState::Running { .. } => TaskStatus::Running,
            JobTaskState::Finished { .. } => TaskStatus::Finished,
            JobTaskState::Failed { .. } => TaskStatus::Failed,
            JobTaskState::Canceled { .. } => TaskStatus::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobTaskState::Finished { .. }
                | JobTaskState::Failed { .. }
                | JobTaskState::Canceled { .. }
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobTaskInfo {
    pub state: JobTaskState,
    pub task_id: JobTaskId,
}

impl JobTaskInfo {
    pub fn make_task_info(&self) -> TaskInfo {
        let started = self.state.started_data();
        let ended_at = match &self.state {
            JobTaskState::Finished { end_date, .. } | JobTaskState::Failed { end_date, .. } => {
                Some(*end_date)
            }
            JobTaskState::Canceled { cancelled_date, .. } => Some(*cancelled_date),
            JobTaskState::Waiting
            | JobTaskState::Ready
            | JobTaskState::Assigned { .. }
            | JobTaskState::Running { .. } => None,
        };
        let (instance_id, workers) = match (&self.state, started) {
            (
                JobTaskState::Assigned {
                    instance_id,
                    worker_ids,
                },
                _,
            ) => (Some(*instance_id), worker_ids.clone()),
            (_, Some(started)) => (Some(started.instance_id), started.worker_ids.clone()),
            (_, None) => (None, SmallVec::new()),
        };
        TaskInfo {
            id: self.task_id,
            status: self.state.status(),
            instance_id,
            workers,
            started_at: started.map(|s| s.start_date),
            ended_at,
            error: match &self.state {
                JobTaskState::Failed { error, .. } => Some(error.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct JobTaskCounters {
    pub n_running_tasks: JobTaskCount,
    pub n_finished_tasks: JobTaskCount,
    pub n_failed_tasks: JobTaskCount,
    pub n_canceled_tasks: JobTaskCount,
}

impl std::ops::Add<JobTaskCounters> for JobTaskCounters {
    type Output = JobTaskCounters;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            n_running_tasks: self.n_running_tasks + rhs.n_running_tasks,
            n_finished_tasks: self.n_finished_tasks + rhs.n_finished_tasks,
            n_failed_tasks: self.n_failed_tasks + rhs.n_failed_tasks,
            n_canceled_tasks: self.n_canceled_tasks + rhs.n_canceled_tasks,
        }
    }
}

impl JobTaskCounters {
    pub fn n_waiting_tasks(&self, n_tasks: JobTaskCount) -> JobTaskCount {
        n_tasks
            - self.n_running_tasks
            - self.n_finished_tasks
            - self.n_failed_tasks
            - self.n_canceled_tasks
    }

    pub fn has_unsuccessful_tasks(&self) -> bool {
        self.n_failed_tasks > 0 || self.n_canceled_tasks > 0
    }

    pub fn is_terminated(&self, n_tasks: JobTaskCount) -> bool {
        self.n_running_tasks == 0 && self.n_waiting_tasks(n_tasks) == 0
    }
}

/// Result of applying a state change to a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    Changed,
    /// The task already was in the target state
    Repeated,
}

fn invalid_transition(task_id: JobTaskId, state: &JobTaskState, target: &str) -> TaskhiveError {
    TaskhiveError::invalid_state(format!(
        "Invalid transition of task {task_id} from {:?} to {target}",
        state.status()
    ))
}

pub struct Job {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub counters: JobTaskCounters,

    pub tasks: Map<JobTaskId, JobTaskInfo>,

    /// Open jobs accept new submissions and never terminate
    pub is_open: bool,
    /// Cancellation was requested by a client
    pub cancel_requested: bool,

    pub submission_date: DateTime<Utc>,
    pub completion_date: Option<DateTime<Utc>>,

    /// Holds channels that will receive information about the job after the it finishes in any way.
    /// You can subscribe to the completion message with [`Self::subscribe_to_completion`].
    completion_callbacks: Vec<oneshot::Sender<JobId>>,
}

impl Job {
    pub fn new(job_id: JobId, spec: JobSpec, is_open: bool) -> Self {
        Job {
            job_id,
            spec,
            counters: Default::default(),
            tasks: Default::default(),
            is_open,
            cancel_requested: false,
            submission_date: Utc::now(),
            completion_date: None,
            completion_callbacks: Default::default(),
        }
    }

    pub fn add_tasks(&mut self, task_ids: impl Iterator<Item = JobTaskId>) {
        for task_id in task_ids {
            let previous = self.tasks.insert(
                task_id,
                JobTaskInfo {
                    state: JobTaskState::Waiting,
                    task_id,
                },
            );
            assert!(previous.is_none(), "Task {task_id} inserted twice");
        }
        // Tasks appended to an open job make it running again
        self.completion_date = None;
    }

    /// Takes back tasks of a submission that the engine rejected
    pub fn remove_tasks(&mut self, task_ids: &[JobTaskId]) {
        for task_id in task_ids {
            if let Some(info) = self.tasks.remove(task_id) {
                assert!(
                    matches!(info.state, JobTaskState::Waiting),
                    "Removing task {task_id} that was already processed"
                );
            }
        }
    }

    #[inline]
    pub fn n_tasks(&self) -> JobTaskCount {
        self.tasks.len() as JobTaskCount
    }

    pub fn is_terminated(&self) -> bool {
        !self.is_open && self.counters.is_terminated(self.n_tasks())
    }

    pub fn status(&self) -> JobStatus {
        let counters = &self.counters;
        if counters.n_failed_tasks > 0 && self.spec.failure_policy == FailurePolicy::Fail {
            return JobStatus::Failed;
        }
        if self.cancel_requested {
            return JobStatus::Canceled;
        }
        if self.is_terminated() {
            return if counters.n_failed_tasks > 0 {
                JobStatus::Failed
            } else if counters.n_canceled_tasks > 0 {
                JobStatus::Canceled
            } else {
                JobStatus::Finished
            };
        }
        if counters.n_waiting_tasks(self.n_tasks()) < self.n_tasks() {
            JobStatus::Running
        } else {
            JobStatus::Submitted
        }
    }

    pub fn make_job_info(&self) -> JobInfo {
        JobInfo {
            id: self.job_id,
            name: self.spec.name.clone(),
            status: self.status(),
            n_tasks: self.n_tasks(),
            counters: self.counters,
            is_open: self.is_open,
            max_fails: self.spec.max_fails,
            submission_date: self.submission_date,
            completion_date: self.completion_date,
        }
    }

    /// Tasks of the job sorted by their id; an empty filter selects all states.
    pub fn make_task_list(&self, filter: &[TaskStatus]) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .values()
            .filter(|task| filter.is_empty() || filter.contains(&task.state.status()))
            .map(|task| task.make_task_info())
            .collect();
        tasks.sort_unstable_by_key(|task| task.id);
        tasks
    }

    pub fn get_task_state(&self, task_id: JobTaskId) -> Option<&JobTaskState> {
        self.tasks.get(&task_id).map(|info| &info.state)
    }

    fn get_task_state_mut(&mut self, task_id: JobTaskId) -> crate::Result<&mut JobTaskState> {
        self.tasks
            .get_mut(&task_id)
            .map(|info| &mut info.state)
            .ok_or_else(|| {
                TaskhiveError::invalid_state(format!(
                    "Task {task_id} not found in job {}",
                    self.job_id
                ))
            })
    }

    pub fn iter_task_states(&self) -> impl Iterator<Item = (JobTaskId, &JobTaskState)> + '_ {
        self.tasks.iter().map(|(k, v)| (*k, &v.state))
    }

    pub fn non_finished_task_ids(&self) -> Vec<TaskId> {
        let mut result: Vec<TaskId> = self
            .iter_task_states()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(task_id, _)| TaskId::new(self.job_id, task_id))
            .collect();
        result.sort_unstable();
        result
    }

    pub fn has_exceeded_max_fails(&self) -> bool {
        self.spec
            .max_fails
            .is_some_and(|max_fails| self.counters.n_failed_tasks > max_fails)
    }

    /// Marks the job as completed if all its tasks ended.
    /// Returns true only for the call that completed the job.
    pub fn check_termination(&mut self, now: DateTime<Utc>) -> bool {
        if self.completion_date.is_none() && self.is_terminated() {
            self.completion_date = Some(now);
            for handler in self.completion_callbacks.drain(..) {
                handler.send(self.job_id).ok();
            }
            true
        } else {
            false
        }
    }

    /// The engine queued the task: it was submitted without unfinished
    /// dependencies, its dependencies finished, or it was returned to the queue.
    pub fn set_ready_state(&mut self, task_id: JobTaskId) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        let was_running = match state {
            JobTaskState::Waiting | JobTaskState::Assigned { .. } => false,
            JobTaskState::Running { .. } => true,
            JobTaskState::Ready => return Ok(Transition::Repeated),
            state => return Err(invalid_transition(task_id, state, "ready")),
        };
        *state = JobTaskState::Ready;
        if was_running {
            self.counters.n_running_tasks -= 1;
        }
        Ok(Transition::Changed)
    }

    pub fn set_assigned_state(
        &mut self,
        task_id: JobTaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
    ) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        match state {
            JobTaskState::Assigned {
                instance_id: current,
                ..
            } if *current == instance_id => return Ok(Transition::Repeated),
            JobTaskState::Waiting | JobTaskState::Ready | JobTaskState::Assigned { .. } => {}
            state => return Err(invalid_transition(task_id, state, "assigned")),
        }
        *state = JobTaskState::Assigned {
            instance_id,
            worker_ids: worker_ids.iter().copied().collect(),
        };
        Ok(Transition::Changed)
    }

    pub fn set_running_state(
        &mut self,
        task_id: JobTaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
        now: DateTime<Utc>,
    ) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        let started_data = StartedTaskData {
            start_date: now,
            instance_id,
            worker_ids: worker_ids.iter().copied().collect(),
        };
        match state {
            JobTaskState::Waiting | JobTaskState::Ready | JobTaskState::Assigned { .. } => {
                *state = JobTaskState::Running { started_data };
                self.counters.n_running_tasks += 1;
                Ok(Transition::Changed)
            }
            JobTaskState::Running {
                started_data: current,
            } => {
                if current.instance_id == instance_id {
                    Ok(Transition::Repeated)
                } else {
                    *current = started_data;
                    Ok(Transition::Changed)
                }
            }
            state => Err(invalid_transition(task_id, state, "running")),
        }
    }

    /// Forgets where a task ran before a restart; the engine reports it as ready again.
    pub fn set_waiting_state(&mut self, task_id: JobTaskId) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        match state {
            JobTaskState::Running { .. } => {
                *state = JobTaskState::Waiting;
                self.counters.n_running_tasks -= 1;
                Ok(Transition::Changed)
            }
            JobTaskState::Waiting => Ok(Transition::Repeated),
            state => Err(invalid_transition(task_id, state, "waiting")),
        }
    }

    pub fn set_finished_state(
        &mut self,
        task_id: JobTaskId,
        now: DateTime<Utc>,
    ) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        match state {
            JobTaskState::Running { started_data } => {
                *state = JobTaskState::Finished {
                    started_data: started_data.clone(),
                    end_date: now,
                };
                self.counters.n_running_tasks -= 1;
                self.counters.n_finished_tasks += 1;
                Ok(Transition::Changed)
            }
            JobTaskState::Finished { .. } => Ok(Transition::Repeated),
            state => Err(invalid_transition(task_id, state, "finished")),
        }
    }

    pub fn set_failed_state(
        &mut self,
        task_id: JobTaskId,
        error: String,
        now: DateTime<Utc>,
    ) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        match state {
            JobTaskState::Running { started_data } => {
                *state = JobTaskState::Failed {
                    started_data: Some(started_data.clone()),
                    end_date: now,
                    error,
                };
                self.counters.n_running_tasks -= 1;
            }
            JobTaskState::Waiting | JobTaskState::Ready | JobTaskState::Assigned { .. } => {
                *state = JobTaskState::Failed {
                    started_data: None,
                    end_date: now,
                    error,
                };
            }
            JobTaskState::Failed { .. } => return Ok(Transition::Repeated),
            state => return Err(invalid_transition(task_id, state, "failed")),
        }
        self.counters.n_failed_tasks += 1;
        Ok(Transition::Changed)
    }

    pub fn set_cancel_state(
        &mut self,
        task_id: JobTaskId,
        now: DateTime<Utc>,
    ) -> crate::Result<Transition> {
        let state = self.get_task_state_mut(task_id)?;
        match state {
            JobTaskState::Running { started_data } => {
                *state = JobTaskState::Canceled {
                    started_data: Some(started_data.clone()),
                    cancelled_date: now,
                };
                self.counters.n_running_tasks -= 1;
            }
            JobTaskState::Waiting | JobTaskState::Ready | JobTaskState::Assigned { .. } => {
                *state = JobTaskState::Canceled {
                    started_data: None,
                    cancelled_date: now,
                };
            }
            JobTaskState::Canceled { .. } => return Ok(Transition::Repeated),
            state => return Err(invalid_transition(task_id, state, "canceled")),
        }
        self.counters.n_canceled_tasks += 1;
        Ok(Transition::Changed)
    }

    /// Subscribes to the completion event of this job.
    /// When the job finishes in any way (completion, failure, cancellation), the channel will
    /// receive a single message.
    pub fn subscribe_to_completion(&mut self) -> oneshot::Receiver<JobId> {
        let (tx, rx) = oneshot::channel();
        self.completion_callbacks.push(tx);
        rx
    }
}
