use hive::events::EventProcessor;
use hive::gateway::LostWorkerReason;
use hive::internal::messages::common::TaskFailInfo;
use hive::worker::{ChannelId, WorkerConfiguration};

use crate::server::Senders;
use crate::server::state::StateRef;
use crate::stream::StreamKey;
use crate::{InstanceId, TaskId, WorkerId};

/// Applies events reported by the engine to jobs, the journal and output streams.
pub(crate) struct EngineEventProcessor {
    state_ref: StateRef,
    senders: Senders,
}

impl EngineEventProcessor {
    pub fn new(state_ref: StateRef, senders: Senders) -> EngineEventProcessor {
        EngineEventProcessor { state_ref, senders }
    }
}

impl EventProcessor for EngineEventProcessor {
    fn on_task_ready(&mut self, task_id: TaskId) {
        self.state_ref.get_mut().process_task_ready(task_id);
    }

    fn on_task_assigned(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
    ) {
        self.state_ref
            .get_mut()
            .process_task_assigned(task_id, instance_id, worker_ids);
    }

    fn on_task_started(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        worker_ids: &[WorkerId],
    ) {
        self.state_ref.get_mut().process_task_started(
            &self.senders,
            task_id,
            instance_id,
            worker_ids,
        );
    }

    fn on_task_finished(&mut self, task_id: TaskId) {
        self.state_ref
            .get_mut()
            .process_task_finished(&self.senders, task_id);
    }

    fn on_task_error(&mut self, task_id: TaskId, consumers: Vec<TaskId>, error_info: TaskFailInfo) {
        self.state_ref.get_mut().process_task_failed(
            &self.senders,
            task_id,
            consumers,
            error_info,
        );
    }

    fn on_task_retry(
        &mut self,
        task_id: TaskId,
        new_instance_id: InstanceId,
        error_info: &TaskFailInfo,
    ) {
        self.state_ref
            .get_mut()
            .process_task_retry(task_id, new_instance_id, error_info);
    }

    fn on_tasks_canceled(&mut self, task_ids: &[TaskId]) {
        self.state_ref
            .get_mut()
            .process_tasks_canceled(&self.senders, task_ids);
    }

    fn on_task_output(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        channel: ChannelId,
        data: Vec<u8>,
        eof: bool,
    ) {
        self.senders.streams.get_mut().on_output(
            StreamKey {
                task_id,
                instance_id,
                channel,
            },
            data,
            eof,
        );
    }

    fn on_worker_new(&mut self, worker_id: WorkerId, configuration: &WorkerConfiguration) {
        self.state_ref
            .get_mut()
            .process_worker_new(&self.senders, worker_id, configuration)
    }

    fn on_worker_lost(
        &mut self,
        worker_id: WorkerId,
        running_tasks: &[TaskId],
        reason: LostWorkerReason,
    ) {
        self.state_ref.get_mut().process_worker_lost(
            &self.senders,
            worker_id,
            running_tasks,
            reason,
        )
    }
}
