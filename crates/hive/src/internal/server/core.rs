use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gateway;
use crate::internal::common::index::IdCounter;
use crate::internal::common::resources::{
    GlobalResourceMapping, ResourceId, ResourceIdMap, ResourceRequest, ResourceRequestEntry,
};
use crate::internal::common::{Map, Set, WrappedRcRefCell};
use crate::internal::scheduler::queue::{EqualPriorityPolicy, ReadyQueue};
use crate::internal::server::task::{Task, TaskConfiguration, TaskRuntimeState};
use crate::internal::server::taskmap::TaskMap;
use crate::internal::server::worker::{Worker, WorkerAssignment};
use crate::internal::server::workergroup::WorkerGroup;
use crate::internal::server::workermap::WorkerMap;
use crate::{TaskId, WorkerId};
use orion::aead::SecretKey;
use serde_json::json;

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

pub(crate) struct CoreSplitMut<'a> {
    pub task_map: &'a mut TaskMap,
    pub worker_map: &'a mut WorkerMap,
    pub ready_queue: &'a mut ReadyQueue,
    pub worker_groups: &'a Map<String, WorkerGroup>,
}

/// Timeouts that drive liveness decisions of the server.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// A worker without a heartbeat for this long is considered lost
    pub heartbeat_timeout: Duration,
    /// How long to wait for a worker to acknowledge a cancel
    pub cancel_grace: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        LivenessConfig {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

#[derive(Default)]
pub struct Core {
    tasks: TaskMap,
    workers: WorkerMap,
    worker_groups: Map<String, WorkerGroup>,
    resource_map: GlobalResourceMapping,
    ready_queue: ReadyQueue,

    // Deadlines of tasks that were asked to stop but did not acknowledge it yet
    cancel_deadlines: Map<TaskId, Instant>,

    submit_counter: u64,
    worker_id_counter: IdCounter<WorkerId>,
    worker_listen_port: u16,

    idle_timeout: Option<Duration>,
    liveness: LivenessConfig,
    dispatch_halted: bool,

    secret_key: Option<Arc<SecretKey>>,
    server_uid: String,
}

pub(crate) type CoreRef = WrappedRcRefCell<Core>;

impl CoreRef {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_listen_port: u16,
        secret_key: Option<Arc<SecretKey>>,
        idle_timeout: Option<Duration>,
        liveness: LivenessConfig,
        policy: EqualPriorityPolicy,
        resource_kinds: &[String],
        server_uid: String,
        worker_id_initial_value: WorkerId,
    ) -> Self {
        let mut core = Core::new(liveness, policy, worker_id_initial_value);
        for name in resource_kinds {
            core.get_or_create_resource_id(name);
        }
        core.worker_listen_port = worker_listen_port;
        core.secret_key = secret_key;
        core.idle_timeout = idle_timeout;
        core.server_uid = server_uid;
        CoreRef::wrap(core)
    }
}

impl Core {
    pub fn new(
        liveness: LivenessConfig,
        policy: EqualPriorityPolicy,
        worker_id_initial_value: WorkerId,
    ) -> Self {
        Core {
            liveness,
            ready_queue: ReadyQueue::new(policy),
            worker_id_counter: IdCounter::new(worker_id_initial_value.as_num()),
            ..Default::default()
        }
    }

    #[inline]
    pub(crate) fn split_mut(&mut self) -> CoreSplitMut<'_> {
        CoreSplitMut {
            task_map: &mut self.tasks,
            worker_map: &mut self.workers,
            ready_queue: &mut self.ready_queue,
            worker_groups: &self.worker_groups,
        }
    }

    pub fn new_worker_id(&mut self) -> WorkerId {
        self.worker_id_counter.increment()
    }

    pub fn worker_groups(&self) -> &Map<String, WorkerGroup> {
        &self.worker_groups
    }

    pub fn idle_timeout(&self) -> &Option<Duration> {
        &self.idle_timeout
    }

    pub fn liveness(&self) -> &LivenessConfig {
        &self.liveness
    }

    pub fn server_uid(&self) -> &str {
        &self.server_uid
    }

    pub fn get_worker_listen_port(&self) -> u16 {
        self.worker_listen_port
    }

    pub fn secret_key(&self) -> Option<&Arc<SecretKey>> {
        self.secret_key.as_ref()
    }

    pub fn is_dispatch_halted(&self) -> bool {
        self.dispatch_halted
    }

    pub fn halt_dispatch(&mut self) {
        if !self.dispatch_halted {
            log::error!("Dispatching of tasks was halted");
            self.dispatch_halted = true;
        }
    }

    // Workers

    pub fn new_worker(&mut self, worker: Worker) {
        let worker_id = worker.id;
        if let Some(g) = self.worker_groups.get_mut(&worker.configuration.group) {
            g.new_worker(worker_id);
        } else {
            let mut worker_ids = Set::default();
            worker_ids.insert(worker_id);
            self.worker_groups.insert(
                worker.configuration.group.clone(),
                WorkerGroup::new(worker_ids),
            );
        }
        self.workers.add(worker);
    }

    pub fn remove_worker(&mut self, worker_id: WorkerId) -> Worker {
        let worker = self.workers.take(worker_id);
        if let Some(group) = self.worker_groups.get_mut(&worker.configuration.group) {
            group.remove_worker(worker_id);
            if group.is_empty() {
                self.worker_groups.remove(&worker.configuration.group);
            }
        }
        worker
    }

    #[inline]
    pub fn get_worker_by_id(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.find_worker(id)
    }

    #[inline]
    pub fn get_worker_by_id_or_panic(&self, id: WorkerId) -> &Worker {
        self.workers.get_worker(id)
    }

    #[inline]
    pub fn get_worker_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.find_worker_mut(id)
    }

    #[inline]
    pub fn get_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    #[inline]
    pub fn get_worker_map(&self) -> &WorkerMap {
        &self.workers
    }

    #[inline]
    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    // Tasks

    /// Inserts a task; Ready tasks are put into the ready queue
    pub fn add_task(&mut self, mut task: Task) {
        self.submit_counter += 1;
        task.submit_seq = self.submit_counter;
        if task.is_ready() {
            self.ready_queue
                .push(task.id, task.priority(), task.submit_seq);
        }
        self.tasks.register(task);
    }

    /// Moves a task whose dependencies are finished (or that was retried) into the ready queue
    pub fn set_task_ready(&mut self, task_id: TaskId) {
        let task = self.tasks.get_task_mut(task_id);
        assert!(task.assignment().is_none());
        task.state = TaskRuntimeState::Ready;
        self.ready_queue
            .push(task.id, task.priority(), task.submit_seq);
    }

    /// Removes a task from the core; it is up to the caller to take care of its assignment
    #[must_use]
    pub fn remove_task(&mut self, task_id: TaskId) -> Task {
        let task = self.tasks.take(task_id);
        match &task.state {
            TaskRuntimeState::Ready => {
                self.ready_queue
                    .remove(task_id, task.priority(), task.submit_seq);
            }
            TaskRuntimeState::Waiting(_) => {
                self.tasks.unlink_consumer(task_id, &task.task_deps);
            }
            TaskRuntimeState::Assigned(_) | TaskRuntimeState::Running(_) => {}
        }
        self.cancel_deadlines.remove(&task_id);
        task
    }

    #[inline]
    pub fn task_map(&self) -> &TaskMap {
        &self.tasks
    }

    #[inline]
    pub fn get_task(&self, task_id: TaskId) -> &Task {
        self.tasks.get_task(task_id)
    }

    #[inline]
    pub fn get_task_mut(&mut self, task_id: TaskId) -> &mut Task {
        self.tasks.get_task_mut(task_id)
    }

    #[inline]
    pub fn find_task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.find_task(task_id)
    }

    #[inline]
    pub fn find_task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.find_task_mut(task_id)
    }

    #[inline]
    pub fn ready_queue(&self) -> &ReadyQueue {
        &self.ready_queue
    }

    // Cancellation

    pub fn set_cancel_deadline(&mut self, task_id: TaskId, deadline: Instant) {
        self.cancel_deadlines.insert(task_id, deadline);
    }

    /// Tasks whose workers did not acknowledge the cancel in time
    pub fn expired_cancellations(&self, now: Instant) -> Vec<TaskId> {
        let mut expired: Vec<TaskId> = self
            .cancel_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(task_id, _)| *task_id)
            .collect();
        expired.sort_unstable();
        expired
    }

    // Resources

    #[inline]
    pub fn get_or_create_resource_id(&mut self, name: &str) -> ResourceId {
        self.resource_map.get_or_allocate_resource_id(name)
    }

    /// Translates a named request of a client, unknown resource kinds are rejected
    pub fn convert_client_resource_rq(
        &self,
        request: &gateway::ResourceRequest,
    ) -> crate::Result<ResourceRequest> {
        let entries = request
            .resources
            .iter()
            .map(|entry| -> crate::Result<ResourceRequestEntry> {
                Ok(ResourceRequestEntry {
                    resource_id: self.resource_map.get_resource_id(&entry.resource)?,
                    request: entry.policy.clone(),
                })
            })
            .collect::<crate::Result<_>>()?;
        Ok(ResourceRequest::new(
            request.n_nodes,
            request.min_time,
            entries,
        ))
    }

    /// Translates an engine request back into a named one
    pub fn convert_to_client_resource_rq(&self, request: &ResourceRequest) -> gateway::ResourceRequest {
        let map = self.create_resource_map();
        gateway::ResourceRequest {
            n_nodes: request.n_nodes(),
            resources: request
                .entries()
                .iter()
                .map(|entry| gateway::ResourceRequestEntry {
                    resource: map
                        .get_name(entry.resource_id)
                        .unwrap_or("unknown")
                        .to_string(),
                    policy: entry.request.clone(),
                })
                .collect(),
            min_time: request.min_time(),
        }
    }

    #[inline]
    pub fn resource_map(&self) -> &GlobalResourceMapping {
        &self.resource_map
    }

    #[inline]
    pub fn create_resource_map(&self) -> ResourceIdMap {
        self.resource_map.create_resource_id_map()
    }

    /// Shape of the current backlog, used for allocation hints
    pub fn backlog_summary(&self) -> gateway::BacklogSummary {
        let mut summary = gateway::BacklogSummary {
            n_workers: self.workers.len() as u32,
            n_idle_workers: self.workers.n_idle() as u32,
            ..Default::default()
        };
        let mut shapes: Map<*const TaskConfiguration, (Rc<TaskConfiguration>, u32)> = Map::default();
        for task in self.tasks.iter() {
            match &task.state {
                TaskRuntimeState::Waiting(_) => summary.n_waiting += 1,
                TaskRuntimeState::Ready => {
                    summary.n_ready += 1;
                    shapes
                        .entry(Rc::as_ptr(&task.configuration))
                        .or_insert_with(|| (task.configuration.clone(), 0))
                        .1 += 1;
                }
                TaskRuntimeState::Assigned(_) | TaskRuntimeState::Running(_) => {
                    summary.n_assigned_or_running += 1
                }
            }
        }
        let mut merged: Map<gateway::ResourceRequest, u32> = Map::default();
        for (configuration, count) in shapes.into_values() {
            let request = self.convert_to_client_resource_rq(&configuration.resources);
            *merged.entry(request).or_default() += count;
        }
        summary.shapes = merged
            .into_iter()
            .map(|(request, n_tasks)| gateway::BacklogShape { request, n_tasks })
            .collect();
        summary.shapes.sort_by(|a, b| {
            b.n_tasks
                .cmp(&a.n_tasks)
                .then_with(|| a.request.to_string().cmp(&b.request.to_string()))
        });
        summary
    }

    pub fn dump(&self, now: Instant) -> serde_json::Value {
        let workers: Vec<_> = self
            .workers
            .sorted_ids()
            .into_iter()
            .map(|worker_id| {
                let worker = self.workers.get_worker(worker_id);
                json!({
                    "id": worker.id,
                    "group": worker.group(),
                    "tasks": worker.assigned_task_ids(),
                    "remaining_time": worker.remaining_time(now).map(|d| d.as_secs_f64()),
                    "stopping": worker.is_stopping(),
                })
            })
            .collect();
        json!({
            "workers": workers,
            "worker_groups": self.worker_groups.iter().map(|(k, v)|
                json!({"name": k,
                       "workers": v.worker_ids().collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            "n_tasks": self.tasks.len(),
            "n_ready": self.ready_queue.len(),
            "dispatch_halted": self.dispatch_halted,
        })
    }

    #[cfg(test)]
    pub fn sanity_check(&self) {
        use crate::internal::common::resources::ResourcePool;
        use crate::internal::server::task::Assignment;

        for worker in self.workers.iter() {
            let worker_id = &worker.id;
            let mut pool = ResourcePool::new(
                &worker.configuration.resources,
                &self.resource_map.create_resource_id_map(),
            );
            match worker.assignment() {
                WorkerAssignment::Sn(sn) => {
                    for task_id in &sn.assign_tasks {
                        let task = self.get_task(*task_id);
                        match task.assignment() {
                            Some(Assignment::Single {
                                worker_id: w,
                                allocation,
                            }) => {
                                assert_eq!(w, worker_id);
                                assert!(pool.try_claim(allocation), "Overcommitted worker");
                            }
                            other => panic!("Invalid assignment of {task_id}: {other:?}"),
                        }
                    }
                    for resource_id in 0..self.resource_map.n_resources() as u32 {
                        let resource_id = ResourceId::new(resource_id);
                        assert_eq!(
                            pool.free_amount(resource_id),
                            worker.pool.free_amount(resource_id)
                        );
                    }
                }
                WorkerAssignment::Mn(mn) => {
                    let task = self.get_task(mn.task_id);
                    match task.assignment() {
                        Some(Assignment::Multi { workers }) => {
                            assert!(workers.contains(worker_id));
                            assert_eq!(workers[0] != *worker_id, mn.reservation_only);
                        }
                        other => panic!("Invalid assignment of {}: {other:?}", mn.task_id),
                    }
                    assert!(worker.pool.is_fully_free());
                }
            }
        }

        let mut n_ready = 0;
        for task in self.tasks.iter() {
            match &task.state {
                TaskRuntimeState::Waiting(info) => {
                    let count = self.tasks.count_registered(&task.task_deps);
                    assert_eq!(info.unfinished_deps as usize, count);
                    assert!(info.unfinished_deps > 0);
                }
                TaskRuntimeState::Ready => {
                    n_ready += 1;
                    assert_eq!(self.tasks.count_registered(&task.task_deps), 0);
                }
                TaskRuntimeState::Assigned(a) | TaskRuntimeState::Running(a) => {
                    let n_workers = a.worker_ids().len();
                    let expected = task.configuration.resources.n_nodes().max(1) as usize;
                    assert_eq!(n_workers, expected);
                    let unique: Set<WorkerId> = a.worker_ids().iter().copied().collect();
                    assert_eq!(unique.len(), n_workers);
                    for worker_id in a.worker_ids() {
                        assert!(self.workers.is_connected(*worker_id));
                    }
                }
            }
            for consumer in task.get_consumers() {
                assert!(self.get_task(*consumer).is_waiting());
            }
        }
        assert_eq!(n_ready, self.ready_queue.len());
    }
}

#[cfg(test)]
mod tests {
    use crate::internal::server::task::Task;
    use crate::internal::server::worker::Worker;
    use crate::internal::server::workergroup::WorkerGroup;
    use crate::internal::tests::utils::env::TestEnv;
    use crate::internal::tests::utils::task::TaskBuilder;

    use crate::internal::server::core::Core;
    use crate::{TaskId, WorkerId};

    impl Core {
        pub fn worker_group(&self, group_name: &str) -> Option<&WorkerGroup> {
            self.worker_groups.get(group_name)
        }

        pub fn assert_task_condition<F: Fn(&Task) -> bool>(&self, task_ids: &[TaskId], op: F) {
            for task_id in task_ids {
                if !op(self.get_task(*task_id)) {
                    panic!(
                        "Task {task_id} does not satisfy the condition, state: {:?}",
                        self.get_task(*task_id).state
                    );
                }
            }
        }

        pub fn assert_worker_condition<F: Fn(&Worker) -> bool>(
            &self,
            worker_ids: &[WorkerId],
            op: F,
        ) {
            for worker_id in worker_ids {
                if !op(self.get_worker_by_id_or_panic(*worker_id)) {
                    panic!("Worker {worker_id} does not satisfy the condition");
                }
            }
        }

        pub fn assert_waiting(&self, task_ids: &[TaskId]) {
            self.assert_task_condition(task_ids, |t| t.is_waiting());
        }

        pub fn assert_ready(&self, task_ids: &[TaskId]) {
            self.assert_task_condition(task_ids, |t| t.is_ready());
        }

        pub fn assert_assigned(&self, task_ids: &[TaskId]) {
            self.assert_task_condition(task_ids, |t| t.is_assigned());
        }

        pub fn assert_running(&self, task_ids: &[TaskId]) {
            self.assert_task_condition(task_ids, |t| t.is_running());
        }

        pub fn assert_removed(&self, task_ids: &[TaskId]) {
            for task_id in task_ids {
                assert!(
                    self.find_task(*task_id).is_none(),
                    "Task {task_id} is still present"
                );
            }
        }
    }

    #[test]
    fn add_remove() {
        let mut rt = TestEnv::new();
        let t = rt.new_task(TaskBuilder::new(1));
        rt.core().assert_ready(&[t]);
        assert_eq!(rt.core().ready_queue().len(), 1);
        let task = rt.core().remove_task(t);
        assert!(task.is_ready());
        assert!(rt.core().find_task(t).is_none());
        assert!(rt.core().ready_queue().is_empty());
    }

    #[test]
    fn remove_waiting_task_unlinks_consumer() {
        let mut rt = TestEnv::new();
        let a = rt.new_task(TaskBuilder::new(1));
        let b = rt.new_task(TaskBuilder::new(2).task_deps(&[a]));
        rt.core().assert_waiting(&[b]);
        let _ = rt.core().remove_task(b);
        assert!(rt.core().get_task(a).get_consumers().is_empty());
        rt.core().sanity_check();
    }

    #[test]
    fn unknown_resource_kind_is_rejected() {
        let mut rt = TestEnv::new();
        let mut rq = crate::gateway::ResourceRequest::default();
        rq.resources[0].resource = "fpgas".to_string();
        assert!(rt.core().convert_client_resource_rq(&rq).is_err());
        rq.resources[0].resource = "gpus/nvidia".to_string();
        assert!(rt.core().convert_client_resource_rq(&rq).is_ok());
    }
}
