use crate::gateway::LostWorkerReason;
use crate::internal::messages::common::TaskFailInfo;
use crate::worker::{ChannelId, WorkerConfiguration};
use crate::{InstanceId, TaskId, WorkerId};

/// Receiver of everything the engine reports to the layer above it.
///
/// Every task that enters the engine ends with exactly one of
/// `on_task_finished`, `on_task_error` (for the failed task, its consumers are
/// reported in the same call) or `on_tasks_canceled`.
pub trait EventProcessor {
    /// The task entered the ready queue: it was submitted without unfinished
    /// dependencies, its last dependency finished or its assignment was withdrawn
    /// before it started.
    fn on_task_ready(&mut self, task_id: TaskId);

    /// The task was bound to `worker_ids` (rank 0 first), it has not started yet
    fn on_task_assigned(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
    );

    fn on_task_started(&mut self, task_id: TaskId, instance_id: InstanceId, worker_ids: &[WorkerId]);

    fn on_task_finished(&mut self, task_id: TaskId);

    /// The task failed for good, `consumers` were canceled because of it
    fn on_task_error(&mut self, task_id: TaskId, consumers: Vec<TaskId>, error_info: TaskFailInfo);

    /// The task failed but it was put back into the ready queue as `new_instance_id`
    fn on_task_retry(&mut self, task_id: TaskId, new_instance_id: InstanceId, error_info: &TaskFailInfo);

    fn on_tasks_canceled(&mut self, task_ids: &[TaskId]);

    fn on_task_output(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        channel: ChannelId,
        data: Vec<u8>,
        eof: bool,
    );

    fn on_worker_new(&mut self, worker_id: WorkerId, configuration: &WorkerConfiguration);

    fn on_worker_lost(&mut self, worker_id: WorkerId, running_tasks: &[TaskId], reason: LostWorkerReason);
}
