use crate::events::EventProcessor;
use crate::gateway::LostWorkerReason;
use crate::internal::common::Map;
use crate::internal::common::resources::{ResourceDescriptor, ResourceDescriptorItem};
use crate::internal::messages::common::{TaskFailInfo, TaskFailKind};
use crate::internal::messages::worker::{ChannelId, ComputeTaskMsg, ToWorkerMessage};
use crate::internal::scheduler::queue::EqualPriorityPolicy;
use crate::internal::scheduler::state::SchedulerState;
use crate::internal::server::comm::Comm;
use crate::internal::server::core::{Core, LivenessConfig};
use crate::internal::server::reactor::{
    on_cancel_tasks, on_liveness_sweep, on_new_worker, on_remove_worker, on_worker_heartbeat,
};
use crate::internal::server::task::Task;
use crate::internal::server::worker::Worker;
use crate::internal::tests::utils;
use crate::internal::tests::utils::resources::cpus_compact;
use crate::internal::tests::utils::schedule;
use crate::internal::tests::utils::task::TaskBuilder;
use crate::internal::transfer::auth::{deserialize, serialize};
use crate::internal::worker::configuration::{
    DEFAULT_MAX_CHUNK_SIZE, DEFAULT_WORKER_GROUP, ServerLostPolicy, WorkerConfiguration,
};
use crate::{InstanceId, TaskId, WorkerId};
use std::time::{Duration, Instant};

pub fn create_test_worker_config(resources: ResourceDescriptor) -> WorkerConfiguration {
    WorkerConfiguration {
        resources,
        listen_address: "1.1.1.1:123".to_string(),
        hostname: "test".to_string(),
        group: DEFAULT_WORKER_GROUP.to_string(),
        work_dir: Default::default(),
        heartbeat_interval: Duration::from_millis(1000),
        idle_timeout: None,
        time_limit: None,
        on_server_lost: ServerLostPolicy::Stop,
        max_output_chunk: DEFAULT_MAX_CHUNK_SIZE,
        extra: Default::default(),
    }
}

pub struct TestEnv {
    core: Core,
    comm: TestComm,
    now: Instant,
    task_id_counter: u32,
    worker_id_counter: u32,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> TestEnv {
        Self::with_policy(EqualPriorityPolicy::Fifo)
    }

    pub fn with_policy(policy: EqualPriorityPolicy) -> TestEnv {
        crate::internal::tests::utils::enable_test_logging();
        TestEnv {
            core: Core::new(LivenessConfig::default(), policy, WorkerId::new(100)),
            comm: TestComm::default(),
            now: Instant::now(),
            task_id_counter: 10,
            worker_id_counter: 100,
        }
    }

    pub fn core(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn comm(&mut self) -> &mut TestComm {
        &mut self.comm
    }

    pub fn core_and_comm(&mut self) -> (&mut Core, &mut TestComm) {
        (&mut self.core, &mut self.comm)
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance_time(&mut self, duration: Duration) {
        self.now += duration;
    }

    pub fn task(&self, task_id: TaskId) -> &Task {
        self.core.get_task(task_id)
    }

    pub fn worker(&self, worker_id: WorkerId) -> &Worker {
        self.core.get_worker_by_id_or_panic(worker_id)
    }

    pub fn new_task(&mut self, builder: TaskBuilder) -> TaskId {
        let task = builder.build();
        let task_id = task.id;
        schedule::submit_test_tasks(&mut self.core, vec![task]);
        task_id
    }

    pub fn new_ready_tasks_cpus(&mut self, tasks: &[u64]) -> Vec<TaskId> {
        let tasks: Vec<_> = tasks
            .iter()
            .map(|n_cpus| {
                let task_id = self.task_id_counter;
                self.task_id_counter += 1;
                TaskBuilder::new(task_id)
                    .resources(cpus_compact(*n_cpus))
                    .build()
            })
            .collect();
        let task_ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        schedule::submit_test_tasks(&mut self.core, tasks);
        task_ids
    }

    pub fn new_worker(&mut self, mut configuration: WorkerConfiguration) -> WorkerId {
        let worker_id = WorkerId::new(self.worker_id_counter);
        self.worker_id_counter += 1;
        configuration.hostname = format!("test{worker_id}");
        configuration.listen_address = format!("1.1.1.{worker_id}:123");
        for item in &configuration.resources.resources {
            self.core.get_or_create_resource_id(&item.name);
        }
        let worker = Worker::new(
            worker_id,
            configuration,
            &self.core.create_resource_map(),
            self.now,
        );
        on_new_worker(&mut self.core, &mut TestComm::default(), worker);
        worker_id
    }

    /// Workers with the given number of cpus (and the given extra resources) in one socket
    pub fn new_workers_ext(
        &mut self,
        defs: &[(u32, Option<Duration>, Vec<ResourceDescriptorItem>)],
    ) -> Vec<WorkerId> {
        defs.iter()
            .map(|(cpus, time_limit, items)| {
                let mut descriptor = ResourceDescriptor::simple_cpus(*cpus);
                for item in items {
                    descriptor = descriptor.with_item(item.clone());
                }
                let mut config = create_test_worker_config(descriptor);
                config.time_limit = *time_limit;
                self.new_worker(config)
            })
            .collect()
    }

    pub fn new_workers(&mut self, cpus: &[u32]) -> Vec<WorkerId> {
        let defs: Vec<_> = cpus.iter().map(|c| (*c, None, Vec::new())).collect();
        self.new_workers_ext(&defs)
    }

    pub fn new_workers_in_group(&mut self, cpus: &[u32], group: &str) -> Vec<WorkerId> {
        cpus.iter()
            .map(|c| {
                let mut config = create_test_worker_config(ResourceDescriptor::simple_cpus(*c));
                config.group = group.to_string();
                self.new_worker(config)
            })
            .collect()
    }

    pub fn schedule(&mut self) {
        let mut scheduler = SchedulerState::new(self.now);
        scheduler.run_scheduling(&mut self.core, &mut self.comm);
        self.core.sanity_check();
    }

    pub fn check_worker_tasks(&self, worker_id: WorkerId, tasks: &[TaskId]) {
        assert_eq!(
            self.worker(worker_id).assigned_task_ids(),
            utils::sorted_vec(tasks.to_vec())
        );
    }

    pub fn assigned_worker(&self, task_id: TaskId) -> WorkerId {
        self.task(task_id)
            .assignment()
            .unwrap_or_else(|| panic!("Task {task_id} is not assigned"))
            .root_worker()
    }

    pub fn start(&mut self, task_id: TaskId) {
        schedule::start_on_worker(&mut self.core, &mut self.comm, task_id);
    }

    pub fn finish(&mut self, task_id: TaskId) {
        schedule::finish_on_worker(&mut self.core, &mut self.comm, task_id);
    }

    pub fn fail(&mut self, task_id: TaskId, info: TaskFailInfo) {
        schedule::fail_on_worker(&mut self.core, &mut self.comm, task_id, info);
    }

    pub fn cancel(&mut self, task_ids: &[TaskId]) -> Vec<TaskId> {
        let now = self.now;
        on_cancel_tasks(&mut self.core, &mut self.comm, task_ids, now)
    }

    pub fn lose_worker(&mut self, worker_id: WorkerId, reason: LostWorkerReason) {
        on_remove_worker(&mut self.core, &mut self.comm, worker_id, reason);
        self.core.sanity_check();
    }

    pub fn heartbeat(&mut self, worker_id: WorkerId) {
        on_worker_heartbeat(&mut self.core, worker_id, self.now);
    }

    pub fn liveness_sweep(&mut self) {
        let now = self.now;
        on_liveness_sweep(&mut self.core, &mut self.comm, now);
        self.core.sanity_check();
    }
}

#[derive(Default, Debug)]
pub struct TestComm {
    pub worker_msgs: Map<WorkerId, Vec<ToWorkerMessage>>,
    pub broadcast_msgs: Vec<ToWorkerMessage>,
    pub disconnected: Vec<WorkerId>,

    // Ready and assigned notifications are not part of `emptiness_check`
    pub client_task_ready: Vec<TaskId>,
    pub client_task_assigned: Vec<(TaskId, InstanceId, Vec<WorkerId>)>,
    pub client_task_started: Vec<(TaskId, InstanceId, Vec<WorkerId>)>,
    pub client_task_finished: Vec<TaskId>,
    pub client_task_errors: Vec<(TaskId, Vec<TaskId>, TaskFailInfo)>,
    pub client_task_retries: Vec<(TaskId, InstanceId, TaskFailKind)>,
    pub client_task_canceled: Vec<TaskId>,
    pub client_outputs: Vec<(TaskId, InstanceId, ChannelId, Vec<u8>, bool)>,

    pub new_workers: Vec<WorkerId>,
    pub lost_workers: Vec<(WorkerId, Vec<TaskId>, LostWorkerReason)>,

    pub need_scheduling: bool,
}

impl TestComm {
    pub fn take_worker_msgs(&mut self, worker_id: WorkerId, len: usize) -> Vec<ToWorkerMessage> {
        let msgs = self.worker_msgs.remove(&worker_id).unwrap_or_default();
        if len != 0 {
            assert_eq!(msgs.len(), len);
        }
        msgs
    }

    /// Compute messages sent to a worker, other messages are dropped
    pub fn take_compute_msgs(&mut self, worker_id: WorkerId) -> Vec<ComputeTaskMsg> {
        self.take_worker_msgs(worker_id, 0)
            .into_iter()
            .filter_map(|msg| match msg {
                ToWorkerMessage::ComputeTask(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn take_client_task_ready(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.client_task_ready)
    }

    pub fn take_client_task_assigned(&mut self) -> Vec<(TaskId, InstanceId, Vec<WorkerId>)> {
        std::mem::take(&mut self.client_task_assigned)
    }

    pub fn take_client_task_started(&mut self, len: usize) -> Vec<(TaskId, InstanceId, Vec<WorkerId>)> {
        assert_eq!(self.client_task_started.len(), len);
        std::mem::take(&mut self.client_task_started)
    }

    pub fn take_client_task_finished(&mut self, len: usize) -> Vec<TaskId> {
        assert_eq!(self.client_task_finished.len(), len);
        std::mem::take(&mut self.client_task_finished)
    }

    pub fn take_client_task_errors(
        &mut self,
        len: usize,
    ) -> Vec<(TaskId, Vec<TaskId>, TaskFailInfo)> {
        assert_eq!(self.client_task_errors.len(), len);
        std::mem::take(&mut self.client_task_errors)
    }

    pub fn take_client_task_retries(&mut self, len: usize) -> Vec<(TaskId, InstanceId, TaskFailKind)> {
        assert_eq!(self.client_task_retries.len(), len);
        std::mem::take(&mut self.client_task_retries)
    }

    pub fn take_client_task_canceled(&mut self) -> Vec<TaskId> {
        utils::sorted_vec(std::mem::take(&mut self.client_task_canceled))
    }

    pub fn take_lost_workers(&mut self) -> Vec<(WorkerId, Vec<TaskId>, LostWorkerReason)> {
        std::mem::take(&mut self.lost_workers)
    }

    /// Forgets everything that was recorded so far
    pub fn clear(&mut self) {
        *self = TestComm::default();
    }

    pub fn emptiness_check(&self) {
        if !self.worker_msgs.is_empty() {
            let ids: Vec<_> = self.worker_msgs.keys().collect();
            panic!("Unexpected worker messages for workers: {ids:?}");
        }
        assert!(self.broadcast_msgs.is_empty());
        assert!(self.disconnected.is_empty());
        assert!(self.client_task_started.is_empty());
        assert!(self.client_task_finished.is_empty());
        assert!(self.client_task_errors.is_empty());
        assert!(self.client_task_retries.is_empty());
        assert!(self.client_task_canceled.is_empty());
        assert!(self.lost_workers.is_empty());
    }
}

impl Comm for TestComm {
    fn send_worker_message(&mut self, worker_id: WorkerId, message: &ToWorkerMessage) {
        let data = serialize(&message).unwrap();
        let message = deserialize(&data).unwrap();
        self.worker_msgs.entry(worker_id).or_default().push(message);
    }

    fn broadcast_worker_message(&mut self, message: &ToWorkerMessage) {
        let data = serialize(&message).unwrap();
        let message = deserialize(&data).unwrap();
        self.broadcast_msgs.push(message);
    }

    fn ask_for_scheduling(&mut self) {
        self.need_scheduling = true;
    }

    fn disconnect_worker(&mut self, worker_id: WorkerId) {
        self.disconnected.push(worker_id);
    }

    fn client(&mut self) -> &mut dyn EventProcessor {
        self
    }
}

impl EventProcessor for TestComm {
    fn on_task_ready(&mut self, task_id: TaskId) {
        self.client_task_ready.push(task_id);
    }

    fn on_task_assigned(&mut self, task_id: TaskId, instance_id: InstanceId, worker_ids: &[WorkerId]) {
        self.client_task_assigned
            .push((task_id, instance_id, worker_ids.to_vec()));
    }

    fn on_task_started(&mut self, task_id: TaskId, instance_id: InstanceId, worker_ids: &[WorkerId]) {
        self.client_task_started
            .push((task_id, instance_id, worker_ids.to_vec()));
    }

    fn on_task_finished(&mut self, task_id: TaskId) {
        self.client_task_finished.push(task_id);
    }

    fn on_task_error(&mut self, task_id: TaskId, consumers: Vec<TaskId>, error_info: TaskFailInfo) {
        self.client_task_errors
            .push((task_id, consumers, error_info));
    }

    fn on_task_retry(&mut self, task_id: TaskId, new_instance_id: InstanceId, error_info: &TaskFailInfo) {
        self.client_task_retries
            .push((task_id, new_instance_id, error_info.kind));
    }

    fn on_tasks_canceled(&mut self, task_ids: &[TaskId]) {
        self.client_task_canceled.extend_from_slice(task_ids);
    }

    fn on_task_output(
        &mut self,
        task_id: TaskId,
        instance_id: InstanceId,
        channel: ChannelId,
        data: Vec<u8>,
        eof: bool,
    ) {
        self.client_outputs
            .push((task_id, instance_id, channel, data, eof));
    }

    fn on_worker_new(&mut self, worker_id: WorkerId, _configuration: &WorkerConfiguration) {
        self.new_workers.push(worker_id);
    }

    fn on_worker_lost(&mut self, worker_id: WorkerId, running_tasks: &[TaskId], reason: LostWorkerReason) {
        self.lost_workers
            .push((worker_id, running_tasks.to_vec(), reason));
    }
}
