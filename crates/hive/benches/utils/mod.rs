use std::rc::Rc;
use std::time::{Duration, Instant};

use hive::events::EventProcessor;
use hive::gateway::LostWorkerReason;
use hive::internal::messages::common::TaskFailInfo;
use hive::internal::messages::worker::ToWorkerMessage;
use hive::internal::scheduler::queue::EqualPriorityPolicy;
use hive::internal::server::comm::Comm;
use hive::internal::server::core::{Core, LivenessConfig};
use hive::internal::server::task::{Task, TaskConfiguration};
use hive::internal::server::worker::Worker;
use hive::resources::{
    AllocationRequest, CPU_RESOURCE_ID, ResourceAmount, ResourceDescriptor, ResourceRequest,
    ResourceRequestEntry,
};
use hive::worker::{ChannelId, ServerLostPolicy, WorkerConfiguration};
use hive::{InstanceId, TaskId, WorkerId};

pub fn create_core() -> Core {
    let mut core = Core::new(
        LivenessConfig::default(),
        EqualPriorityPolicy::Fifo,
        WorkerId::new(1),
    );
    core.get_or_create_resource_id("cpus");
    core
}

pub fn create_task(id: u32) -> Task {
    let request = ResourceRequest::new(
        0,
        Duration::ZERO,
        smallvec::smallvec![ResourceRequestEntry {
            resource_id: CPU_RESOURCE_ID,
            request: AllocationRequest::Compact(ResourceAmount::new(1)),
        }],
    );
    let conf = TaskConfiguration {
        resources: request,
        user_priority: 0,
        time_limit: None,
        retry: Default::default(),
    };
    Task::new(TaskId::new_test(id), Default::default(), Rc::new(conf), Box::new([]))
}

pub fn create_worker(core: &Core, id: u32, n_cpus: u32) -> Worker {
    Worker::new(
        WorkerId::new(id),
        WorkerConfiguration {
            resources: ResourceDescriptor::simple_cpus(n_cpus),
            listen_address: String::new(),
            hostname: format!("node{id}"),
            group: "default".to_string(),
            work_dir: Default::default(),
            heartbeat_interval: Duration::from_secs(8),
            idle_timeout: None,
            time_limit: None,
            on_server_lost: ServerLostPolicy::Stop,
            max_output_chunk: 0,
            extra: Default::default(),
        },
        &core.create_resource_map(),
        Instant::now(),
    )
}

/// Adds ready tasks with ids `0..count`
pub fn add_tasks(core: &mut Core, count: u32) -> Vec<TaskId> {
    (0..count)
        .map(|id| {
            let task = create_task(id);
            let task_id = task.id;
            core.add_task(task);
            core.set_task_ready(task_id);
            task_id
        })
        .collect()
}

#[derive(Default)]
pub struct NullComm {
    events: NullEvents,
}

impl Comm for NullComm {
    fn send_worker_message(&mut self, _worker_id: WorkerId, _message: &ToWorkerMessage) {}

    fn broadcast_worker_message(&mut self, _message: &ToWorkerMessage) {}

    fn ask_for_scheduling(&mut self) {}

    fn disconnect_worker(&mut self, _worker_id: WorkerId) {}

    fn client(&mut self) -> &mut dyn EventProcessor {
        &mut self.events
    }
}

#[derive(Default)]
struct NullEvents;

impl EventProcessor for NullEvents {
    fn on_task_ready(&mut self, _: TaskId) {}

    fn on_task_assigned(&mut self, _: TaskId, _: InstanceId, _: &[WorkerId]) {}

    fn on_task_started(&mut self, _: TaskId, _: InstanceId, _: &[WorkerId]) {}

    fn on_task_finished(&mut self, _: TaskId) {}

    fn on_task_error(&mut self, _: TaskId, _: Vec<TaskId>, _: TaskFailInfo) {}

    fn on_task_retry(&mut self, _: TaskId, _: InstanceId, _: &TaskFailInfo) {}

    fn on_tasks_canceled(&mut self, _: &[TaskId]) {}

    fn on_task_output(&mut self, _: TaskId, _: InstanceId, _: ChannelId, _: Vec<u8>, _: bool) {}

    fn on_worker_new(&mut self, _: WorkerId, _: &WorkerConfiguration) {}

    fn on_worker_lost(&mut self, _: WorkerId, _: &[TaskId], _: LostWorkerReason) {}
}
