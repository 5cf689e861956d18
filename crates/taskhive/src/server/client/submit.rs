use bstr::BString;
use hive::gateway::{SharedTaskConfiguration, TaskConfiguration, TaskSubmit};
use thin_vec::ThinVec;

use crate::common::error::TaskhiveError;
use crate::server::Senders;
use crate::server::job::{Job, JobTaskState};
use crate::server::state::StateRef;
use crate::transfer::messages::{
    JobDescription, SubmitRequest, SubmitResponse, TaskBody, TaskDescription, ToClientMessage,
};
use crate::{JobId, JobTaskId, Set, TaskId};

pub(crate) fn handle_submit(
    state_ref: &StateRef,
    senders: &Senders,
    request: SubmitRequest,
) -> ToClientMessage {
    match submit_job(state_ref, senders, request) {
        Ok(response) => ToClientMessage::SubmitResponse(response),
        Err(error) => {
            if error.is_client_error() {
                log::debug!("Submission rejected: {error}");
            } else {
                log::warn!("Submission failed: {error}");
            }
            ToClientMessage::Error(error.to_string())
        }
    }
}

/// Validates a submission, registers its tasks and hands them over to the engine.
/// The tasks are registered first because the engine reports them as ready right away;
/// nothing stays recorded when the engine rejects them.
pub(crate) fn submit_job(
    state_ref: &StateRef,
    senders: &Senders,
    request: SubmitRequest,
) -> crate::Result<SubmitResponse> {
    let new_job = request.job_id.is_none();
    let task_ids = job_task_ids(&request.job_desc);
    let (job_id, task_submit) = {
        let mut state = state_ref.get_mut();
        if let Some(reason) = state.halted_reason() {
            return Err(TaskhiveError::invalid_state(format!(
                "Server does not accept new jobs: {reason}"
            )));
        }
        let job_id = match request.job_id {
            Some(job_id) => {
                let job = state.get_job(job_id).ok_or_else(|| {
                    TaskhiveError::validation(format!("Job {job_id} does not exist"))
                })?;
                if job.cancel_requested {
                    return Err(TaskhiveError::validation(format!("Job {job_id} was canceled")));
                }
                if !job.is_open {
                    return Err(TaskhiveError::validation(format!("Job {job_id} is not open")));
                }
                validate_job_desc(&request.job_desc, Some(job))?;
                job_id
            }
            None => {
                validate_job_desc(&request.job_desc, None)?;
                state.new_job_id()
            }
        };
        let task_submit = match build_task_submit(job_id, &request.job_desc, |_| true) {
            Ok(task_submit) => task_submit,
            Err(error) => {
                if new_job {
                    state.revert_job_id(job_id);
                }
                return Err(error);
            }
        };
        match state.get_job_mut(job_id) {
            Some(job) => job.add_tasks(task_ids.iter().copied()),
            None => {
                let mut job = Job::new(job_id, request.spec.clone(), false);
                job.add_tasks(task_ids.iter().copied());
                state.add_job(job);
            }
        }
        (job_id, task_submit)
    };

    // The engine calls back into the state, so it must not be borrowed here
    if let Err(error) = senders.server_ref.add_new_tasks(task_submit) {
        let mut state = state_ref.get_mut();
        if new_job {
            state.remove_job(job_id);
            state.revert_job_id(job_id);
        } else if let Some(job) = state.get_job_mut(job_id) {
            job.remove_tasks(&task_ids);
        }
        return Err(error.into());
    }

    let n_tasks = request.job_desc.task_count();
    log::debug!("Job {job_id} received {n_tasks} task(s)");

    if let Err(error) = senders.events.on_job_submitted(job_id, new_job, &request) {
        log::error!("Submission of job {job_id} could not be journaled: {error}");
    }
    Ok(SubmitResponse { job_id, n_tasks })
}

pub(crate) fn job_task_ids(job_desc: &JobDescription) -> Vec<JobTaskId> {
    match job_desc {
        JobDescription::Array { ids, .. } => ids.iter().map(JobTaskId::new).collect(),
        JobDescription::Graph { tasks } => tasks.iter().map(|task| task.id).collect(),
    }
}

fn validate_job_desc(job_desc: &JobDescription, existing: Option<&Job>) -> crate::Result<()> {
    let taken = |task_id: JobTaskId| existing.is_some_and(|job| job.tasks.contains_key(&task_id));
    let mut ids: Set<JobTaskId> = Set::default();
    for task_id in job_task_ids(job_desc) {
        if !ids.insert(task_id) || taken(task_id) {
            return Err(TaskhiveError::validation(format!(
                "Task id {task_id} is used more than once"
            )));
        }
    }
    if ids.is_empty() {
        return Err(TaskhiveError::validation("Submission does not contain any task"));
    }

    match job_desc {
        JobDescription::Array {
            ids: array,
            entries: Some(entries),
            ..
        } => {
            if entries.len() != array.id_count() as usize {
                return Err(TaskhiveError::validation(format!(
                    "Number of entries ({}) does not match the number of tasks ({})",
                    entries.len(),
                    array.id_count()
                )));
            }
        }
        JobDescription::Array { .. } => {}
        JobDescription::Graph { tasks } => {
            for task in tasks {
                for &dep in &task.dependencies {
                    if dep == task.id {
                        return Err(TaskhiveError::validation(format!(
                            "Task {} depends on itself",
                            task.id
                        )));
                    }
                    if ids.contains(&dep) {
                        continue;
                    }
                    match existing.and_then(|job| job.get_task_state(dep)) {
                        Some(JobTaskState::Failed { .. } | JobTaskState::Canceled { .. }) => {
                            return Err(TaskhiveError::validation(format!(
                                "Task {} depends on task {dep} that did not finish successfully",
                                task.id
                            )));
                        }
                        Some(_) => {}
                        None => {
                            return Err(TaskhiveError::validation(format!(
                                "Task {} depends on unknown task {dep}",
                                task.id
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn shared_configuration(task_desc: &TaskDescription) -> SharedTaskConfiguration {
    SharedTaskConfiguration {
        resources: task_desc.resources.clone(),
        time_limit: task_desc.time_limit,
        priority: task_desc.priority,
        retry: task_desc.retry,
    }
}

fn serialize_body(
    task_desc: &TaskDescription,
    entry: Option<&BString>,
) -> crate::Result<Box<[u8]>> {
    let body = TaskBody {
        program: task_desc.program.clone(),
        task_dir: task_desc.task_dir,
        entry: entry.cloned(),
    };
    Ok(hive::comm::serialize(&body)?.into_boxed_slice())
}

/// Engine tasks of a job description; tasks rejected by `include` are left out.
pub(crate) fn build_task_submit(
    job_id: JobId,
    job_desc: &JobDescription,
    include: impl Fn(JobTaskId) -> bool,
) -> crate::Result<TaskSubmit> {
    let mut submit = TaskSubmit::default();
    match job_desc {
        JobDescription::Array {
            ids,
            entries,
            task_desc,
        } => {
            submit.shared_data.push(shared_configuration(task_desc));
            let common_body = serialize_body(task_desc, None)?;
            for (index, id) in ids.iter().enumerate() {
                let task_id = JobTaskId::new(id);
                if !include(task_id) {
                    continue;
                }
                let body = match entries {
                    Some(entries) => serialize_body(task_desc, entries.get(index))?,
                    None => common_body.clone(),
                };
                submit.tasks.push(TaskConfiguration {
                    id: TaskId::new(job_id, task_id),
                    shared_data_index: 0,
                    task_deps: ThinVec::new(),
                    body,
                });
            }
        }
        JobDescription::Graph { tasks } => {
            for task in tasks {
                if !include(task.id) {
                    continue;
                }
                let shared_data_index = submit.shared_data.len() as u32;
                submit.shared_data.push(shared_configuration(&task.task_desc));
                submit.tasks.push(TaskConfiguration {
                    id: TaskId::new(job_id, task.id),
                    shared_data_index,
                    task_deps: task
                        .dependencies
                        .iter()
                        .map(|&dep| TaskId::new(job_id, dep))
                        .collect(),
                    body: serialize_body(&task.task_desc, None)?,
                });
            }
        }
    }
    Ok(submit)
}
