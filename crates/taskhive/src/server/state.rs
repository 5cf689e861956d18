use std::cmp::min;

use chrono::{DateTime, Utc};
use hive::define_wrapped_type;
use hive::gateway::LostWorkerReason;
use hive::internal::messages::common::{TaskFailInfo, TaskFailKind};
use hive::worker::WorkerConfiguration;

use crate::server::Senders;
use crate::server::job::{Job, Transition};
use crate::server::worker::Worker;
use crate::{InstanceId, JobId, Map, Set, TaskId, WorkerId};

pub struct State {
    jobs: Map<JobId, Job>,
    workers: Map<WorkerId, Worker>,
    job_id_counter: u32,
    server_uid: String,
    /// Reason why the server stopped accepting work, see [`State::set_halted`]
    halted: Option<String>,
}

define_wrapped_type!(StateRef, State, pub);

/// Cancels tasks outside of the engine callback that triggered it,
/// the engine cannot be entered again while it is reporting events.
fn cancel_tasks_from_callback(senders: &Senders, job_id: JobId, tasks: Vec<TaskId>) {
    if tasks.is_empty() {
        return;
    }
    log::debug!("Canceling {} task(s) of job {job_id}", tasks.len());
    let server_ref = senders.server_ref.clone();
    tokio::task::spawn_local(async move {
        let canceled = server_ref.cancel_tasks(&tasks);
        log::debug!("{} task(s) of job {job_id} canceled", canceled.len());
    });
}

impl State {
    pub fn get_job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn get_job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn add_job(&mut self, job: Job) {
        let job_id = job.job_id;
        assert!(self.jobs.insert(job_id, job).is_none());
    }

    /// Drops a job whose first submission was rejected
    pub(crate) fn remove_job(&mut self, job_id: JobId) {
        if let Some(job) = self.jobs.remove(&job_id) {
            debug_assert!(job.tasks.values().all(|task| !task.state.is_terminal()));
        }
    }

    /// Completely forgets this job, in order to reduce memory usage.
    pub(crate) fn forget_job(&mut self, job_id: JobId) -> Option<Job> {
        let job = match self.jobs.remove(&job_id) {
            Some(job) => {
                assert!(job.is_terminated());
                job
            }
            None => {
                log::error!("Trying to forget unknown job {job_id}");
                return None;
            }
        };
        Some(job)
    }

    pub fn new_job_id(&mut self) -> JobId {
        let id = self.job_id_counter;
        self.job_id_counter += 1;
        id.into()
    }

    /// Returns the most recently allocated id, when its submission was rejected
    pub fn revert_job_id(&mut self, job_id: JobId) {
        debug_assert_eq!(job_id.as_num() + 1, self.job_id_counter);
        self.job_id_counter = job_id.as_num();
    }

    /// Job ids handed out after a restore continue above the restored ones
    pub(crate) fn set_job_id_counter(&mut self, value: u32) {
        self.job_id_counter = self.job_id_counter.max(value);
    }

    pub fn last_n_ids(&self, n: u32) -> impl Iterator<Item = JobId> + use<> {
        let n = min(n, self.job_id_counter - 1);
        ((self.job_id_counter - n)..self.job_id_counter).map(|id| id.into())
    }

    pub fn server_uid(&self) -> &str {
        &self.server_uid
    }

    /// Stops accepting new jobs, used when the journal cannot be written
    pub fn set_halted(&mut self, reason: String) {
        log::error!("Server does not accept new work anymore: {reason}");
        self.halted = Some(reason);
    }

    pub fn halted_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn add_worker(&mut self, worker: Worker) {
        let worker_id = worker.worker_id();
        assert!(self.workers.insert(worker_id, worker).is_none())
    }

    pub fn get_workers(&self) -> &Map<WorkerId, Worker> {
        &self.workers
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> Option<&Worker> {
        self.workers.get(&worker_id)
    }

    pub fn max_worker_id(&self) -> Option<WorkerId> {
        self.workers.keys().max().copied()
    }

    fn job_of_task(&mut self, task_id: TaskId) -> Option<&mut Job> {
        let job = self.jobs.get_mut(&task_id.job_id());
        if job.is_none() {
            log::debug!("Event for task {task_id} of an unknown job ignored");
        }
        job
    }

    fn check_job_termination(&mut self, senders: &Senders, job_id: JobId, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            if job.check_termination(now) {
                log::debug!("Job {job_id} completed as {}", job.status());
                senders.events.on_job_completed(job_id);
            }
        }
    }

    pub fn process_task_ready(&mut self, task_id: TaskId) {
        let Some(job) = self.job_of_task(task_id) else {
            return;
        };
        if let Err(error) = job.set_ready_state(task_id.job_task_id()) {
            log::error!("{error}");
        }
    }

    pub fn process_task_assigned(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
    ) {
        log::debug!("Task {task_id} instance {instance_id} assigned to {worker_ids:?}");
        let Some(job) = self.job_of_task(task_id) else {
            return;
        };
        if let Err(error) =
            job.set_assigned_state(task_id.job_task_id(), instance_id, worker_ids)
        {
            log::error!("{error}");
        }
    }

    pub fn process_task_started(
        &mut self,
        senders: &Senders,
        task_id: TaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
    ) {
        log::debug!("Task {task_id} started as instance {instance_id} on {worker_ids:?}");
        let Some(job) = self.job_of_task(task_id) else {
            return;
        };
        match job.set_running_state(
            task_id.job_task_id(),
            instance_id,
            worker_ids,
            Utc::now(),
        ) {
            Ok(Transition::Changed) => senders.events.on_task_started(
                task_id.job_id(),
                task_id.job_task_id(),
                instance_id,
                worker_ids.iter().copied().collect(),
            ),
            Ok(Transition::Repeated) => {}
            Err(error) => log::error!("{error}"),
        }
    }

    pub fn process_task_finished(&mut self, senders: &Senders, task_id: TaskId) {
        log::debug!("Task {task_id} finished");
        let now = Utc::now();
        let Some(job) = self.job_of_task(task_id) else {
            return;
        };
        match job.set_finished_state(task_id.job_task_id(), now) {
            Ok(Transition::Changed) => {
                senders
                    .events
                    .on_task_finished(task_id.job_id(), task_id.job_task_id());
                self.check_job_termination(senders, task_id.job_id(), now);
            }
            Ok(Transition::Repeated) => {}
            Err(error) => log::error!("{error}"),
        }
    }

    pub fn process_task_retry(
        &mut self,
        task_id: TaskId,
        new_instance_id: InstanceId,
        error_info: &TaskFailInfo,
    ) {
        log::info!(
            "Task {task_id} failed ({}: {}), it was returned to the queue as instance {new_instance_id}",
            error_info.kind,
            error_info.message
        );
        let Some(job) = self.job_of_task(task_id) else {
            return;
        };
        if let Err(error) = job.set_ready_state(task_id.job_task_id()) {
            log::error!("{error}");
        }
    }

    pub fn process_task_failed(
        &mut self,
        senders: &Senders,
        task_id: TaskId,
        consumers: Vec<TaskId>,
        error_info: TaskFailInfo,
    ) {
        log::debug!("Task {task_id} failed: {error_info:?}");
        let now = Utc::now();
        let job_id = task_id.job_id();
        let Some(job) = self.job_of_task(task_id) else {
            return;
        };
        let error = match error_info.kind {
            TaskFailKind::TaskBody => error_info.message,
            kind => format!("{kind}: {}", error_info.message),
        };
        match job.set_failed_state(task_id.job_task_id(), error.clone(), now) {
            Ok(Transition::Changed) => {
                senders
                    .events
                    .on_task_failed(job_id, task_id.job_task_id(), error);
                if job.has_exceeded_max_fails() {
                    let task_ids = job.non_finished_task_ids();
                    cancel_tasks_from_callback(senders, job_id, task_ids);
                }
            }
            Ok(Transition::Repeated) => {}
            Err(error) => log::error!("{error}"),
        }

        if !consumers.is_empty() {
            log::debug!("Tasks {consumers:?} canceled because of failed dependency {task_id}");
            self.cancel_tasks(senders, &consumers, now);
        }
        self.check_job_termination(senders, job_id, now);
    }

    pub fn process_tasks_canceled(&mut self, senders: &Senders, task_ids: &[TaskId]) {
        log::debug!("Tasks {task_ids:?} canceled");
        self.cancel_tasks(senders, task_ids, Utc::now());
    }

    fn cancel_tasks(&mut self, senders: &Senders, task_ids: &[TaskId], now: DateTime<Utc>) {
        let mut job_ids: Set<JobId> = Set::default();
        for &task_id in task_ids {
            let Some(job) = self.job_of_task(task_id) else {
                continue;
            };
            match job.set_cancel_state(task_id.job_task_id(), now) {
                Ok(Transition::Changed) => {
                    senders
                        .events
                        .on_task_canceled(task_id.job_id(), task_id.job_task_id());
                    job_ids.insert(task_id.job_id());
                }
                Ok(Transition::Repeated) => {}
                Err(error) => log::error!("{error}"),
            }
        }
        for job_id in job_ids {
            self.check_job_termination(senders, job_id, now);
        }
    }

    pub fn process_worker_new(
        &mut self,
        senders: &Senders,
        worker_id: WorkerId,
        configuration: &WorkerConfiguration,
    ) {
        log::info!(
            "Worker {worker_id} registered from {} ({})",
            configuration.hostname,
            configuration.listen_address
        );
        self.add_worker(Worker::new(worker_id, configuration.clone()));
        senders
            .events
            .on_worker_added(worker_id, configuration.clone());
    }

    pub fn process_worker_lost(
        &mut self,
        senders: &Senders,
        worker_id: WorkerId,
        running_tasks: &[TaskId],
        reason: LostWorkerReason,
    ) {
        log::info!(
            "Worker {worker_id} lost ({reason}), running tasks: {}",
            running_tasks.len()
        );
        match self.workers.get_mut(&worker_id) {
            Some(worker) => {
                if !worker.mark_lost(reason) {
                    return;
                }
                log::debug!("Worker {worker_id} on {} is offline", worker.hostname());
            }
            None => log::error!("Unknown worker {worker_id} lost"),
        }
        senders.events.on_worker_lost(worker_id, reason);
    }
}

impl StateRef {
    pub fn new(server_uid: String) -> StateRef {
        Self(hive::WrappedRcRefCell::wrap(State {
            jobs: Default::default(),
            workers: Default::default(),
            job_id_counter: 1,
            server_uid,
            halted: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::JobId;
    use crate::server::job::Job;
    use crate::server::state::StateRef;
    use crate::transfer::messages::JobSpec;

    #[test]
    fn test_last_n_ids() {
        let state_ref = StateRef::new("uid".to_string());
        let mut state = state_ref.get_mut();
        assert_eq!(state.last_n_ids(3).count(), 0);
        for _ in 0..5 {
            let job_id = state.new_job_id();
            state.add_job(Job::new(job_id, JobSpec::default(), true));
        }
        let ids: Vec<_> = state.last_n_ids(2).collect();
        assert_eq!(ids, vec![JobId::new(4), JobId::new(5)]);
        assert_eq!(state.last_n_ids(100).count(), 5);
    }

    #[test]
    fn test_job_id_counter_only_grows() {
        let state_ref = StateRef::new("uid".to_string());
        let mut state = state_ref.get_mut();
        state.set_job_id_counter(10);
        state.set_job_id_counter(3);
        assert_eq!(state.new_job_id(), JobId::new(10));
    }
}
