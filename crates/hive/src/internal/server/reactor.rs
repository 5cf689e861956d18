use std::time::Instant;

use crate::gateway::LostWorkerReason;
use crate::internal::common::{Map, Set, SortedVec};
use crate::internal::messages::common::TaskFailInfo;
use crate::internal::messages::worker::{
    PeerReadyMsg, TaskFailedMsg, TaskIdsMsg, TaskInstanceMsg, TaskOutputMsg, TaskRunningMsg,
    ToWorkerMessage,
};
use crate::internal::server::comm::Comm;
use crate::internal::server::core::Core;
use crate::internal::server::retry::on_failed_instance;
use crate::internal::server::task::{Assignment, Task, TaskRuntimeState, WaitingInfo};
use crate::internal::server::worker::Worker;
use crate::{InstanceId, TaskId, WorkerId};

pub(crate) fn on_new_worker(core: &mut Core, comm: &mut impl Comm, worker: Worker) {
    comm.client()
        .on_worker_new(worker.id, &worker.configuration);
    comm.ask_for_scheduling();
    core.new_worker(worker);
}

/// Unbinds a task from its worker(s) and returns the reserved resources.
///
/// For a multi-node task, the remaining peers are released. When the task is
/// detached because `lost_worker` disappeared, the root is also told to stop.
fn detach_task(
    core: &mut Core,
    comm: &mut impl Comm,
    task_id: TaskId,
    lost_worker: Option<WorkerId>,
) {
    let split = core.split_mut();
    let task = split.task_map.get_task_mut(task_id);
    let state = std::mem::replace(
        &mut task.state,
        TaskRuntimeState::Waiting(WaitingInfo { unfinished_deps: 0 }),
    );
    let assignment = match state {
        TaskRuntimeState::Assigned(a) | TaskRuntimeState::Running(a) => a,
        TaskRuntimeState::Waiting(_) | TaskRuntimeState::Ready => {
            panic!("Detaching task {task_id} that is not assigned")
        }
    };
    match &assignment {
        Assignment::Single {
            worker_id,
            allocation,
        } => {
            split
                .worker_map
                .get_worker_mut(*worker_id)
                .remove_sn_task(task_id, allocation);
        }
        Assignment::Multi { workers } => {
            let root = workers[0];
            for worker_id in workers {
                split.worker_map.get_worker_mut(*worker_id).reset_mn_task();
                if Some(*worker_id) == lost_worker {
                    continue;
                }
                if *worker_id == root {
                    if lost_worker.is_some() {
                        comm.send_worker_message(
                            root,
                            &ToWorkerMessage::CancelTasks(TaskIdsMsg { ids: vec![task_id] }),
                        );
                    }
                } else {
                    comm.send_worker_message(
                        *worker_id,
                        &ToWorkerMessage::ReleaseReservation(TaskInstanceMsg {
                            id: task_id,
                            instance_id: task.instance_id,
                        }),
                    );
                }
            }
        }
    }
    comm.ask_for_scheduling();
}

/// Finds a task that is bound to the worker with the reported instance;
/// reports of older instances or from other workers are dropped
fn find_reported_task<'a>(
    core: &'a mut Core,
    worker_id: WorkerId,
    task_id: TaskId,
    instance_id: InstanceId,
) -> Option<&'a mut Task> {
    let Some(task) = core.find_task_mut(task_id) else {
        log::debug!("Report for unknown task {task_id} from worker {worker_id}");
        return None;
    };
    if task.instance_id != instance_id {
        log::debug!(
            "Ignoring report for task {} instance {} (current instance {})",
            task_id,
            instance_id,
            task.instance_id
        );
        return None;
    }
    if !task.assignment().is_some_and(|a| a.root_worker() == worker_id) {
        log::debug!("Ignoring report for task {task_id} from worker {worker_id} that does not run it");
        return None;
    }
    Some(task)
}

pub(crate) fn on_remove_worker(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    reason: LostWorkerReason,
) {
    let Some(worker) = core.get_worker_by_id(worker_id) else {
        log::debug!("Worker {worker_id} was already removed");
        return;
    };
    log::debug!("Removing worker {worker_id} ({reason})");
    let task_ids = worker.assigned_task_ids();

    let mut running_tasks = Vec::new();
    let mut requeue = Vec::new();
    let mut canceled = Vec::new();
    for task_id in task_ids {
        let task = core.get_task(task_id);
        let was_running = task.is_running();
        let canceling = task.is_canceling();
        detach_task(core, comm, task_id, Some(worker_id));
        if canceling {
            canceled.push(task_id);
            continue;
        }
        if was_running {
            running_tasks.push(task_id);
        }
        requeue.push((task_id, was_running));
    }
    let _ = core.remove_worker(worker_id);

    // The lost worker is announced before tasks are failed, so that the upper
    // layer sees which tasks were running on it
    comm.client()
        .on_worker_lost(worker_id, &running_tasks, reason);

    if !canceled.is_empty() {
        finish_cancellation(core, comm, &canceled);
    }

    for (task_id, was_running) in requeue {
        if was_running && reason.is_failure() {
            let info = TaskFailInfo::worker_lost(format!(
                "Task was running on worker {worker_id} that was lost ({reason})"
            ));
            on_failed_instance(core, comm, task_id, info);
        } else {
            let task = core.get_task_mut(task_id);
            task.increment_instance_id();
            let instance_id = task.instance_id;
            log::debug!("Task {task_id} returned to the queue as instance {instance_id}");
            core.set_task_ready(task_id);
            if was_running {
                let info = TaskFailInfo::worker_lost(format!(
                    "Worker {worker_id} running the task has ended ({reason})"
                ));
                comm.client().on_task_retry(task_id, instance_id, &info);
            } else {
                comm.client().on_task_ready(task_id);
            }
        }
    }
    comm.ask_for_scheduling();
}

/// Inserts new tasks, dependencies have to precede their consumers in `new_tasks`.
/// Dependencies that are not known to the engine are considered finished.
pub(crate) fn on_new_tasks(core: &mut Core, comm: &mut impl Comm, new_tasks: Vec<Task>) {
    assert!(!new_tasks.is_empty());
    for mut task in new_tasks {
        let task_id = task.id;
        let mut count = 0;
        task.task_deps.retain(|dep_id| {
            if let Some(dep) = core.find_task_mut(*dep_id) {
                if dep.add_consumer(task_id) {
                    count += 1;
                }
                true
            } else {
                false
            }
        });
        task.state = if count == 0 {
            TaskRuntimeState::Ready
        } else {
            TaskRuntimeState::Waiting(WaitingInfo {
                unfinished_deps: count,
            })
        };
        core.add_task(task);
        if count == 0 {
            comm.client().on_task_ready(task_id);
        }
    }
    comm.ask_for_scheduling()
}

pub(crate) fn on_task_running(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    message: TaskRunningMsg,
) {
    let TaskRunningMsg { id, instance_id } = message;
    let Some(task) = find_reported_task(core, worker_id, id, instance_id) else {
        return;
    };
    if !task.is_assigned() {
        log::debug!("Task {id} is already running");
        return;
    }
    if let TaskRuntimeState::Assigned(assignment) =
        std::mem::replace(&mut task.state, TaskRuntimeState::Ready)
    {
        log::debug!("Task {id} is running on {:?}", assignment.worker_ids());
        comm.client()
            .on_task_started(id, instance_id, assignment.worker_ids());
        task.state = TaskRuntimeState::Running(assignment);
    }
}

pub(crate) fn on_task_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    message: TaskInstanceMsg,
) {
    let task_id = message.id;
    let Some(task) = find_reported_task(core, worker_id, task_id, message.instance_id) else {
        return;
    };
    let canceling = task.is_canceling();
    detach_task(core, comm, task_id, None);
    if canceling {
        log::debug!("Task {task_id} finished while it was being canceled");
        finish_cancellation(core, comm, &[task_id]);
        return;
    }
    log::debug!("Task {task_id} finished on worker {worker_id}");

    let consumers: Vec<TaskId> = core.get_task(task_id).get_consumers().iter().copied().collect();
    for consumer in consumers {
        if core.get_task_mut(consumer).decrease_unfinished_deps() {
            core.set_task_ready(consumer);
            comm.client().on_task_ready(consumer);
        }
    }
    let _ = core.remove_task(task_id);
    comm.client().on_task_finished(task_id);
    comm.ask_for_scheduling();
}

pub(crate) fn on_task_error(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    message: TaskFailedMsg,
) {
    let task_id = message.id;
    let Some(task) = find_reported_task(core, worker_id, task_id, message.instance_id) else {
        return;
    };
    let canceling = task.is_canceling();
    detach_task(core, comm, task_id, None);
    if canceling {
        log::debug!("Task {task_id} failed while it was being canceled");
        finish_cancellation(core, comm, &[task_id]);
        return;
    }
    on_failed_instance(core, comm, task_id, message.info);
}

/// Worker acknowledged that a canceled task is no longer running
pub(crate) fn on_task_canceled(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    message: TaskInstanceMsg,
) {
    let task_id = message.id;
    let Some(task) = find_reported_task(core, worker_id, task_id, message.instance_id) else {
        return;
    };
    if !task.is_canceling() {
        log::warn!("Worker {worker_id} reports task {task_id} canceled, but it was not canceled");
    }
    detach_task(core, comm, task_id, None);
    finish_cancellation(core, comm, &[task_id]);
}

/// Removes tasks (and their consumers) that are no longer running anywhere
fn finish_cancellation(core: &mut Core, comm: &mut impl Comm, task_ids: &[TaskId]) {
    let mut to_remove: Set<TaskId> = Set::default();
    for task_id in task_ids {
        let task = core.get_task(*task_id);
        debug_assert!(task.assignment().is_none());
        to_remove.insert(*task_id);
        to_remove.extend(task.collect_consumers(core.task_map()));
    }
    let canceled = to_remove.to_sorted_vec();
    for task_id in &canceled {
        let _ = core.remove_task(*task_id);
    }
    comm.client().on_tasks_canceled(&canceled);
    comm.ask_for_scheduling();
}

/// Cancels tasks and everything that depends on them.
///
/// Tasks that do not run anywhere are removed immediately. Running tasks are
/// asked to stop and are removed when the worker acknowledges it, or when the
/// grace period expires.
pub(crate) fn on_cancel_tasks(
    core: &mut Core,
    comm: &mut impl Comm,
    task_ids: &[TaskId],
    now: Instant,
) -> Vec<TaskId> {
    let mut to_cancel: Set<TaskId> = Set::default();
    for task_id in task_ids {
        if let Some(task) = core.find_task(*task_id) {
            to_cancel.insert(*task_id);
            to_cancel.extend(task.collect_consumers(core.task_map()));
        } else {
            log::debug!("Canceling unknown task {task_id}");
        }
    }
    log::debug!("Canceling {} tasks", to_cancel.len());

    let deadline = now + core.liveness().cancel_grace;
    let mut removed: Vec<TaskId> = Vec::new();
    let mut stop_on_workers: Map<WorkerId, Vec<TaskId>> = Map::default();
    for task_id in to_cancel.to_sorted_vec() {
        let task = core.get_task_mut(task_id);
        match task.assignment() {
            Some(_) if task.is_canceling() => {}
            Some(assignment) => {
                let root = assignment.root_worker();
                task.set_canceling_flag(true);
                stop_on_workers.entry(root).or_default().push(task_id);
                core.set_cancel_deadline(task_id, deadline);
            }
            None => removed.push(task_id),
        }
    }
    for task_id in &removed {
        let _ = core.remove_task(*task_id);
    }

    let mut stop_on_workers: Vec<_> = stop_on_workers.into_iter().collect();
    stop_on_workers.sort_unstable_by_key(|(worker_id, _)| *worker_id);
    for (worker_id, ids) in stop_on_workers {
        comm.send_worker_message(worker_id, &ToWorkerMessage::CancelTasks(TaskIdsMsg { ids }));
    }
    if !removed.is_empty() {
        comm.client().on_tasks_canceled(&removed);
    }
    comm.ask_for_scheduling();
    removed
}

/// A non-root node of a multi-node task has its reservation in place
pub(crate) fn on_peer_ready(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    message: TaskInstanceMsg,
) {
    let Some(task) = core.find_task(message.id) else {
        log::debug!("Peer ready for unknown task {}", message.id);
        return;
    };
    if task.instance_id != message.instance_id {
        return;
    }
    match &task.state {
        TaskRuntimeState::Assigned(Assignment::Multi { workers })
            if workers[1..].contains(&worker_id) =>
        {
            comm.send_worker_message(
                workers[0],
                &ToWorkerMessage::PeerReady(PeerReadyMsg {
                    id: message.id,
                    instance_id: message.instance_id,
                    worker_id,
                }),
            );
        }
        _ => log::debug!(
            "Unexpected peer ready for task {} from worker {}",
            message.id,
            worker_id
        ),
    }
}

pub(crate) fn on_task_output(
    core: &mut Core,
    comm: &mut impl Comm,
    worker_id: WorkerId,
    message: TaskOutputMsg,
) {
    let TaskOutputMsg {
        id,
        instance_id,
        channel,
        data,
        eof,
    } = message;
    if find_reported_task(core, worker_id, id, instance_id).is_none() {
        return;
    }
    comm.client()
        .on_task_output(id, instance_id, channel, data, eof);
}

pub(crate) fn on_worker_heartbeat(core: &mut Core, worker_id: WorkerId, now: Instant) {
    if let Some(worker) = core.get_worker_mut(worker_id) {
        worker.last_heartbeat = now;
    }
}

/// Removes workers that stopped sending heartbeats and finishes cancellations
/// that were not acknowledged in time.
pub(crate) fn on_liveness_sweep(core: &mut Core, comm: &mut impl Comm, now: Instant) {
    let timeout = core.liveness().heartbeat_timeout;
    let lost: Vec<WorkerId> = core
        .get_worker_map()
        .sorted_ids()
        .into_iter()
        .filter(|worker_id| {
            core.get_worker_by_id_or_panic(*worker_id)
                .is_heartbeat_lost(now, timeout)
        })
        .collect();
    for worker_id in lost {
        log::warn!("Worker {worker_id} missed heartbeats for {timeout:?}, removing it");
        comm.disconnect_worker(worker_id);
        on_remove_worker(core, comm, worker_id, LostWorkerReason::HeartbeatLost);
    }

    let expired = core.expired_cancellations(now);
    if !expired.is_empty() {
        log::warn!("Cancellation of tasks {expired:?} was not acknowledged in time");
        for task_id in &expired {
            detach_task(core, comm, *task_id, None);
        }
        finish_cancellation(core, comm, &expired);
    }
}

/// Asks a worker to stop; it is removed when its connection closes
pub(crate) fn on_stop_worker(core: &mut Core, comm: &mut impl Comm, worker_id: WorkerId) -> crate::Result<()> {
    let worker = core
        .get_worker_mut(worker_id)
        .ok_or_else(|| format!("Worker {worker_id} not found"))?;
    if worker.is_stopping() {
        return Ok(());
    }
    log::debug!("Stopping worker {worker_id}");
    worker.set_stopping_flag(true);
    worker.stop_reason = Some(LostWorkerReason::Stopped);
    comm.send_worker_message(worker_id, &ToWorkerMessage::Stop);
    Ok(())
}
