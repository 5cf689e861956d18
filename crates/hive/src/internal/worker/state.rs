use std::cell::RefMut;
use std::time::Instant;

use crate::internal::common::resources::{ResourceIdMap, ResourcePool};
use crate::internal::common::{Map, WrappedRcRefCell};
use crate::internal::messages::common::TaskFailInfo;
use crate::internal::messages::worker::{
    ComputeTaskMsg, FromWorkerMessage, MnReservationMsg, PeerReadyMsg, TaskFailedMsg,
    TaskInstanceMsg,
};
use crate::internal::worker::comm::{WorkerComm, WorkerCommRef};
use crate::internal::worker::configuration::WorkerConfiguration;
use crate::internal::worker::task::{StopSignal, Task, TaskState};
use crate::launcher::{StopReason, TaskLauncher};
use crate::{InstanceId, TaskId, WorkerId};

pub type WorkerStateRef = WrappedRcRefCell<WorkerState>;

pub struct WorkerState {
    comm: WorkerCommRef,
    tasks: Map<TaskId, Task>,
    /// This worker is a non-root node of a multi-node task
    reservation: Option<MnReservationMsg>,

    pub(crate) worker_id: WorkerId,
    pub(crate) configuration: WorkerConfiguration,
    pub(crate) task_launcher: Box<dyn TaskLauncher>,
    pub(crate) start_time: Instant,
    pub(crate) last_task_finish_time: Instant,

    /// Slices claimed by the tasks stored in `tasks`
    pool: ResourcePool,
    resource_map: ResourceIdMap,
    server_uid: String,
}

impl WorkerStateRef {
    pub fn new(
        comm: WorkerComm,
        worker_id: WorkerId,
        configuration: WorkerConfiguration,
        resource_map: ResourceIdMap,
        task_launcher: Box<dyn TaskLauncher>,
        server_uid: String,
    ) -> Self {
        let now = Instant::now();
        let pool = ResourcePool::new(&configuration.resources, &resource_map);
        WrappedRcRefCell::wrap(WorkerState {
            comm: WrappedRcRefCell::wrap(comm),
            tasks: Default::default(),
            reservation: None,
            worker_id,
            configuration,
            task_launcher,
            start_time: now,
            last_task_finish_time: now,
            pool,
            resource_map,
            server_uid,
        })
    }
}

impl WorkerState {
    pub(crate) fn comm(&self) -> RefMut<'_, WorkerComm> {
        self.comm.get_mut()
    }

    pub(crate) fn comm_ref(&self) -> &WorkerCommRef {
        &self.comm
    }

    fn send(&self, message: FromWorkerMessage) {
        self.comm().send_message_to_server(message);
    }

    pub fn server_uid(&self) -> &str {
        &self.server_uid
    }

    pub fn get_resource_map(&self) -> &ResourceIdMap {
        &self.resource_map
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn get_task(&self, task_id: TaskId) -> &Task {
        self.tasks
            .get(&task_id)
            .unwrap_or_else(|| panic!("Task {task_id} not found"))
    }

    pub fn get_task_mut(&mut self, task_id: TaskId) -> &mut Task {
        self.tasks
            .get_mut(&task_id)
            .unwrap_or_else(|| panic!("Task {task_id} not found"))
    }

    pub fn find_task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    pub fn find_task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&task_id)
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn running_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.is_running())
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn reservation(&self) -> Option<&MnReservationMsg> {
        self.reservation.as_ref()
    }

    /// Nothing runs here and the worker is not held for a multi-node task
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.reservation.is_none()
    }

    /// Stores a new assignment; returns true if the task can be started right away.
    /// An assignment whose slice is already taken here is rejected with a launch error.
    pub fn add_task(&mut self, message: ComputeTaskMsg) -> bool {
        let task_id = message.id;
        let instance_id = message.instance_id;
        // A newer instance replaces one that the server already gave up on
        if let Some(old) = self.tasks.remove(&task_id) {
            log::debug!(
                "Task {task_id} instance {} replaced by instance {instance_id}",
                old.instance_id
            );
            self.pool.release(&old.allocation);
        }
        if !self.pool.try_claim(&message.allocation) {
            log::warn!("Resources of task {task_id} instance {instance_id} are already in use");
            self.send(FromWorkerMessage::TaskFailed(TaskFailedMsg {
                id: task_id,
                instance_id,
                info: TaskFailInfo::launch_error(
                    "Assigned resources are already used by another task".to_string(),
                ),
            }));
            return false;
        }
        let task = Task::new(message);
        let ready = task.is_ready();
        self.tasks.insert(task_id, task);
        ready
    }

    /// Returns the task that may start now because its last peer is ready
    pub fn peer_ready(&mut self, message: PeerReadyMsg) -> Option<TaskId> {
        let task = self.tasks.get_mut(&message.id)?;
        if task.instance_id != message.instance_id {
            log::debug!("Peer ready for old instance of task {}", message.id);
            return None;
        }
        match &mut task.state {
            TaskState::WaitingForPeers(peers) => {
                peers.remove(&message.worker_id);
                log::debug!(
                    "Peer {} ready for task {}, {} remaining",
                    message.worker_id,
                    message.id,
                    peers.len()
                );
                peers.is_empty().then_some(message.id)
            }
            TaskState::Running(_) => None,
        }
    }

    pub fn reserve(&mut self, message: MnReservationMsg) {
        log::debug!(
            "Worker reserved for task {} with root {}",
            message.id,
            message.root
        );
        let reply = TaskInstanceMsg {
            id: message.id,
            instance_id: message.instance_id,
        };
        self.reservation = Some(message);
        self.send(FromWorkerMessage::PeerReady(reply));
    }

    pub fn release_reservation(&mut self, message: TaskInstanceMsg) {
        match &self.reservation {
            Some(r) if r.id == message.id => {
                log::debug!("Reservation for task {} released", message.id);
                self.reservation = None;
                self.reset_idle_timer();
                self.notify_if_empty();
            }
            _ => log::debug!("Release of unknown reservation for task {}", message.id),
        }
    }

    pub fn cancel_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            log::debug!("Canceling unknown task {task_id}");
            return;
        };
        let instance_id = task.instance_id;
        if task.request_stop(StopReason::Cancel) {
            log::debug!("Stopping running task {task_id}");
            return;
        }
        log::debug!("Task {task_id} canceled before it started");
        self.finish_task_cancel(task_id, instance_id);
    }

    /// Tasks that did not start yet are forgotten (used when the server is lost)
    pub fn drop_non_running_tasks(&mut self) {
        let pool = &mut self.pool;
        self.tasks.retain(|_, task| {
            if !task.is_running() {
                pool.release(&task.allocation);
            }
            task.is_running()
        });
    }

    /// Asks all running tasks to stop and forgets the others
    pub fn cancel_all_tasks(&mut self) {
        self.drop_non_running_tasks();
        for task in self.tasks.values_mut() {
            task.request_stop(StopReason::Cancel);
        }
    }

    pub(crate) fn set_running(&mut self, task_id: TaskId, signal: StopSignal) {
        self.get_task_mut(task_id).state = TaskState::Running(signal);
    }

    /// Removes the task if it is still the given instance
    fn remove_task(&mut self, task_id: TaskId, instance_id: InstanceId) -> bool {
        if !self
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.instance_id == instance_id)
        {
            log::debug!("Task {task_id} instance {instance_id} is no longer present");
            return false;
        }
        if let Some(task) = self.tasks.remove(&task_id) {
            self.pool.release(&task.allocation);
        }
        self.reset_idle_timer();
        self.notify_if_empty();
        true
    }

    fn notify_if_empty(&mut self) {
        if self.tasks.is_empty() {
            self.comm().notify_worker_is_empty();
        }
    }

    pub fn reset_idle_timer(&mut self) {
        self.last_task_finish_time = Instant::now();
    }

    pub fn finish_task(&mut self, task_id: TaskId, instance_id: InstanceId) {
        if self.remove_task(task_id, instance_id) {
            self.send(FromWorkerMessage::TaskFinished(TaskInstanceMsg {
                id: task_id,
                instance_id,
            }));
        }
    }

    pub fn finish_task_failed(&mut self, task_id: TaskId, instance_id: InstanceId, info: TaskFailInfo) {
        if self.remove_task(task_id, instance_id) {
            self.send(FromWorkerMessage::TaskFailed(TaskFailedMsg {
                id: task_id,
                instance_id,
                info,
            }));
        }
    }

    pub fn finish_task_cancel(&mut self, task_id: TaskId, instance_id: InstanceId) {
        if self.remove_task(task_id, instance_id) {
            self.send(FromWorkerMessage::TaskCanceled(TaskInstanceMsg {
                id: task_id,
                instance_id,
            }));
        }
    }
}
