use chrono::{DateTime, Utc};
use hive::gateway::TaskSubmit;

use crate::server::client::{build_task_submit, job_task_ids};
use crate::server::event::Event;
use crate::server::event::journal::JournalReader;
use crate::server::event::payload::EventPayload;
use crate::server::job::{Job, JobTaskState};
use crate::server::state::State;
use crate::transfer::messages::SubmitRequest;
use crate::{InstanceId, JobId, JobTaskId, Map, WorkerId};

struct RestorerJob {
    job: Job,
    submissions: Vec<SubmitRequest>,
    last_instances: Map<JobTaskId, InstanceId>,
}

impl RestorerJob {
    fn new(job: Job) -> Self {
        RestorerJob {
            job,
            submissions: Vec::new(),
            last_instances: Default::default(),
        }
    }

    /// Tasks that did not end are queued again with a fresh instance id,
    /// whatever was running before the restart is not trusted.
    fn restore(mut self, state: &mut State) -> crate::Result<Vec<TaskSubmit>> {
        let job_id = self.job.job_id;
        let running: Vec<JobTaskId> = self
            .job
            .iter_task_states()
            .filter(|(_, task_state)| matches!(task_state, JobTaskState::Running { .. }))
            .map(|(task_id, _)| task_id)
            .collect();
        for task_id in running {
            self.job.set_waiting_state(task_id)?;
        }

        let mut submits = Vec::with_capacity(self.submissions.len());
        for request in &self.submissions {
            let job = &self.job;
            let mut submit = build_task_submit(job_id, &request.job_desc, |task_id| {
                job.get_task_state(task_id)
                    .is_some_and(|task_state| !task_state.is_terminal())
            })?;
            if submit.tasks.is_empty() {
                continue;
            }
            for task in &submit.tasks {
                if let Some(instance_id) = self.last_instances.get(&task.id.job_task_id()) {
                    submit
                        .adjust_instance_id
                        .insert(task.id, InstanceId::new(instance_id.as_num() + 1));
                }
            }
            submits.push(submit);
        }
        log::debug!(
            "Job {job_id} restored with {} unfinished task(s)",
            submits.iter().map(|s| s.tasks.len()).sum::<usize>()
        );
        state.add_job(self.job);
        Ok(submits)
    }
}

/// Rebuilds jobs from the events of a journal.
#[derive(Default)]
pub(crate) struct StateRestorer {
    jobs: Map<JobId, RestorerJob>,
    max_job_id: u32,
    max_worker_id: u32,
    server_uid: Option<String>,
}

impl StateRestorer {
    pub fn job_id_counter(&self) -> u32 {
        self.max_job_id + 1
    }

    pub fn worker_id_initial_value(&self) -> WorkerId {
        WorkerId::new(self.max_worker_id + 1)
    }

    /// Identity of the server that wrote the journal, kept by the restored server
    pub fn take_server_uid(&mut self) -> Option<String> {
        self.server_uid.take()
    }

    /// Puts the restored jobs into the state.
    /// Returns the tasks that have to be handed to the engine again.
    pub fn restore_jobs(self, state: &mut State) -> crate::Result<Vec<TaskSubmit>> {
        state.set_job_id_counter(self.job_id_counter());
        let mut jobs: Vec<_> = self.jobs.into_values().collect();
        jobs.sort_unstable_by_key(|job| job.job.job_id);

        let mut submits = Vec::new();
        for job in jobs {
            submits.extend(job.restore(state)?);
        }
        Ok(submits)
    }

    fn job_mut(&mut self, job_id: JobId) -> Option<&mut RestorerJob> {
        let job = self.jobs.get_mut(&job_id);
        if job.is_none() {
            log::warn!("Journal references unknown job {job_id}");
        }
        job
    }

    fn add_job(&mut self, job: Job, time: DateTime<Utc>) -> &mut RestorerJob {
        let job_id = job.job_id;
        self.max_job_id = self.max_job_id.max(job_id.as_num());
        let mut job = RestorerJob::new(job);
        job.job.submission_date = time;
        self.jobs.entry(job_id).insert(job).into_mut()
    }

    fn apply_task_event(
        &mut self,
        job_id: JobId,
        time: DateTime<Utc>,
        apply: impl FnOnce(&mut Job) -> crate::Result<()>,
    ) {
        let Some(job) = self.job_mut(job_id) else {
            return;
        };
        if let Err(error) = apply(&mut job.job) {
            log::warn!("Journal event of job {job_id} ignored: {error}");
        }
        job.job.check_termination(time);
    }

    pub fn load_event(&mut self, event: Event) -> crate::Result<()> {
        let time = event.time;
        match event.payload {
            EventPayload::ServerStart { server_uid } => {
                if self.server_uid.is_none() {
                    self.server_uid = Some(server_uid);
                }
            }
            EventPayload::ServerStop => {}
            EventPayload::WorkerConnected(worker_id, _) => {
                self.max_worker_id = self.max_worker_id.max(worker_id.as_num());
            }
            EventPayload::WorkerLost(_, _) => {}
            EventPayload::Submit {
                job_id,
                closed_job,
                serialized_desc,
            } => {
                let request = serialized_desc.deserialize()?;
                let job = if closed_job {
                    self.add_job(Job::new(job_id, request.spec.clone(), false), time)
                } else {
                    match self.job_mut(job_id) {
                        Some(job) => job,
                        None => return Ok(()),
                    }
                };
                job.job.add_tasks(job_task_ids(&request.job_desc).into_iter());
                job.submissions.push(request);
            }
            EventPayload::JobOpen(job_id, spec) => {
                self.add_job(Job::new(job_id, spec, true), time);
            }
            EventPayload::JobClose(job_id) => {
                if let Some(job) = self.job_mut(job_id) {
                    job.job.is_open = false;
                    job.job.check_termination(time);
                }
            }
            EventPayload::JobCompleted(_) => {}
            EventPayload::JobForgotten(job_id) => {
                self.jobs.remove(&job_id);
            }
            EventPayload::TaskStarted {
                job_id,
                task_id,
                instance_id,
                workers,
            } => {
                if let Some(job) = self.job_mut(job_id) {
                    job.last_instances.insert(task_id, instance_id);
                }
                self.apply_task_event(job_id, time, |job| {
                    job.set_running_state(task_id, instance_id, &workers, time)
                        .map(|_| ())
                });
            }
            EventPayload::TaskFinished { job_id, task_id } => {
                self.apply_task_event(job_id, time, |job| {
                    job.set_finished_state(task_id, time).map(|_| ())
                });
            }
            EventPayload::TaskFailed {
                job_id,
                task_id,
                error,
            } => {
                self.apply_task_event(job_id, time, |job| {
                    job.set_failed_state(task_id, error, time).map(|_| ())
                });
            }
            EventPayload::TaskCanceled { job_id, task_id } => {
                self.apply_task_event(job_id, time, |job| {
                    job.set_cancel_state(task_id, time).map(|_| ())
                });
            }
        }
        Ok(())
    }

    /// Reads all complete events of the journal.
    /// Returns the position after the last complete event; anything behind it is a
    /// partially written record that should be truncated before appending.
    pub fn load_journal(&mut self, mut reader: JournalReader) -> crate::Result<u64> {
        let mut count = 0;
        for event in &mut reader {
            self.load_event(event?)?;
            count += 1;
        }
        log::info!(
            "Journal replayed: {count} event(s), {} job(s) restored",
            self.jobs.len()
        );
        Ok(reader.position())
    }
}
