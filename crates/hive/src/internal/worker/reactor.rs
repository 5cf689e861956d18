use futures::future::Either;
use tokio::sync::oneshot;

use crate::internal::messages::common::TaskFailInfo;
use crate::internal::messages::worker::{FromWorkerMessage, TaskRunningMsg, ToWorkerMessage};
use crate::internal::worker::state::{WorkerState, WorkerStateRef};
use crate::internal::worker::task::StopSignal;
use crate::launcher::{StopReason, TaskBuildContext, TaskFuture, TaskResult};
use crate::{InstanceId, TaskId};

/// Applies a message from the server; returns true when the worker should stop
pub(crate) fn process_worker_message(
    state: &mut WorkerState,
    state_ref: &WorkerStateRef,
    message: ToWorkerMessage,
) -> bool {
    match message {
        ToWorkerMessage::ComputeTask(msg) => {
            log::debug!("Task {} instance {} assigned", msg.id, msg.instance_id);
            let task_id = msg.id;
            if state.add_task(msg) {
                run_task(state, state_ref, task_id);
            }
        }
        ToWorkerMessage::CancelTasks(msg) => {
            for task_id in msg.ids {
                state.cancel_task(task_id);
            }
        }
        ToWorkerMessage::ReserveForTask(msg) => state.reserve(msg),
        ToWorkerMessage::PeerReady(msg) => {
            if let Some(task_id) = state.peer_ready(msg) {
                run_task(state, state_ref, task_id);
            }
        }
        ToWorkerMessage::ReleaseReservation(msg) => state.release_reservation(msg),
        ToWorkerMessage::Stop => {
            log::info!("Received stop command");
            return true;
        }
    }
    false
}

pub(crate) fn run_task(state: &mut WorkerState, state_ref: &WorkerStateRef, task_id: TaskId) {
    let (end_sender, end_receiver) = oneshot::channel();
    let instance_id = state.get_task(task_id).instance_id;

    let build = {
        let task = state.get_task(task_id);
        state
            .task_launcher
            .build_task(TaskBuildContext { task, state }, end_receiver)
    };
    match build {
        Ok(task_future) => {
            log::debug!("Task {task_id} started");
            state.set_running(task_id, StopSignal::new(end_sender));
            state
                .comm()
                .send_message_to_server(FromWorkerMessage::TaskRunning(TaskRunningMsg {
                    id: task_id,
                    instance_id,
                }));
            tokio::task::spawn_local(execute_task(
                task_future,
                state_ref.clone(),
                task_id,
                instance_id,
            ));
        }
        Err(error) => {
            log::debug!("Task initialization failed id={task_id}, error={error:?}");
            state.finish_task_failed(
                task_id,
                instance_id,
                TaskFailInfo::launch_error(error.to_string()),
            );
        }
    }
}

async fn execute_task(
    task_future: TaskFuture,
    state_ref: WorkerStateRef,
    task_id: TaskId,
    instance_id: InstanceId,
) {
    let time_limit = {
        let state = state_ref.get();
        match state.find_task(task_id) {
            Some(task) if task.instance_id == instance_id => task.time_limit,
            // Task was removed before spawn took place
            _ => return,
        }
    };

    let result = if let Some(duration) = time_limit {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        match futures::future::select(task_future, sleep).await {
            Either::Left((r, _)) => r,
            Either::Right((_, task_future)) => {
                {
                    let mut state = state_ref.get_mut();
                    log::debug!("Task {task_id} reached its time limit");
                    if let Some(task) = state.find_task_mut(task_id) {
                        task.request_stop(StopReason::Timeout);
                    }
                }
                task_future.await
            }
        }
    } else {
        task_future.await
    };
    let mut state = state_ref.get_mut();
    match result {
        Ok(TaskResult::Finished) => {
            log::debug!("Task {task_id} finished");
            state.finish_task(task_id, instance_id);
        }
        Ok(TaskResult::Canceled) => {
            log::debug!("Task {task_id} canceled");
            state.finish_task_cancel(task_id, instance_id);
        }
        Ok(TaskResult::Timeouted) => {
            log::debug!("Task {task_id} timeouted");
            state.finish_task_failed(
                task_id,
                instance_id,
                TaskFailInfo::task_body("Time limit reached".to_string()),
            );
        }
        Err(e) => {
            let stop = state
                .find_task(task_id)
                .and_then(|task| task.stop_requested());
            log::debug!("Task {task_id} failed: {e:?}, stop requested: {stop:?}");
            state.finish_task_failed(task_id, instance_id, TaskFailInfo::task_body(e.to_string()));
        }
    }
}
