use std::fmt;

use crate::gateway::{LostWorkerReason, WorkerInfo, WorkerRuntimeInfo};
use crate::internal::common::{Set, SortedVec};
use crate::internal::common::resources::{
    Allocation, ResourceIdMap, ResourcePool, ResourceRequest, TimeRequest,
};
use crate::internal::server::taskmap::TaskMap;
use crate::internal::worker::configuration::WorkerConfiguration;
use crate::{TaskId, WorkerId};
use std::time::{Duration, Instant};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct WorkerFlags: u32 {
        // Stop message was sent, nothing new is assigned to the worker
        const STOPPING = 0b00000001;
    }
}

#[derive(Debug)]
pub struct MultiNodeTaskAssignment {
    pub task_id: TaskId,

    // If true, the task is assigned to this worker only as a reservation,
    // the command itself is executed on the root node.
    pub reservation_only: bool,
}

#[derive(Debug, Default)]
pub struct SingleNodeTaskAssignment {
    pub assign_tasks: Set<TaskId>,
}

#[derive(Debug)]
pub enum WorkerAssignment {
    Sn(SingleNodeTaskAssignment),
    Mn(MultiNodeTaskAssignment),
}

pub struct Worker {
    pub(crate) id: WorkerId,

    assignment: WorkerAssignment,

    /// Allocation ledger of the worker
    pub(crate) pool: ResourcePool,
    pub(crate) flags: WorkerFlags,
    // When the worker will be terminated
    pub(crate) termination_time: Option<Instant>,
    pub(crate) stop_reason: Option<LostWorkerReason>,

    pub(crate) last_heartbeat: Instant,
    pub(crate) configuration: WorkerConfiguration,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("resources", &self.configuration.resources)
            .field("assignment", &self.assignment)
            .finish()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        configuration: WorkerConfiguration,
        resource_map: &ResourceIdMap,
        now: Instant,
    ) -> Self {
        let pool = ResourcePool::new(&configuration.resources, resource_map);
        Self {
            id,
            termination_time: configuration.time_limit.map(|duration| now + duration),
            assignment: WorkerAssignment::Sn(Default::default()),
            pool,
            flags: WorkerFlags::empty(),
            stop_reason: None,
            last_heartbeat: now,
            configuration,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn configuration(&self) -> &WorkerConfiguration {
        &self.configuration
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn group(&self) -> &str {
        &self.configuration.group
    }

    pub fn assignment(&self) -> &WorkerAssignment {
        &self.assignment
    }

    #[inline]
    pub fn sn_assignment(&self) -> Option<&SingleNodeTaskAssignment> {
        match &self.assignment {
            WorkerAssignment::Sn(a) => Some(a),
            WorkerAssignment::Mn(_) => None,
        }
    }

    #[inline]
    pub fn mn_assignment(&self) -> Option<&MultiNodeTaskAssignment> {
        match &self.assignment {
            WorkerAssignment::Sn(_) => None,
            WorkerAssignment::Mn(a) => Some(a),
        }
    }

    pub fn sn_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.sn_assignment()
            .into_iter()
            .flat_map(|a| a.assign_tasks.iter().copied())
    }

    /// Ids of all tasks that hold (a part of) this worker
    pub fn assigned_task_ids(&self) -> Vec<TaskId> {
        match &self.assignment {
            WorkerAssignment::Sn(a) => a.assign_tasks.to_sorted_vec(),
            WorkerAssignment::Mn(a) => vec![a.task_id],
        }
    }

    pub fn set_mn_task(&mut self, task_id: TaskId, reservation_only: bool) {
        assert!(self.is_free(), "Worker {} is not free", self.id);
        assert!(self.pool.is_fully_free());
        self.assignment = WorkerAssignment::Mn(MultiNodeTaskAssignment {
            task_id,
            reservation_only,
        });
    }

    pub fn reset_mn_task(&mut self) {
        assert!(self.mn_assignment().is_some());
        self.assignment = WorkerAssignment::Sn(Default::default());
    }

    pub fn has_mn_task(&self) -> bool {
        matches!(self.assignment, WorkerAssignment::Mn(_))
    }

    /// No task is assigned and the worker accepts new work
    pub fn is_free(&self) -> bool {
        (match &self.assignment {
            WorkerAssignment::Sn(a) => a.assign_tasks.is_empty(),
            WorkerAssignment::Mn(_) => false,
        }) && !self.is_stopping()
    }

    /// Can the worker take a (further) single node task?
    pub fn accepts_sn_tasks(&self) -> bool {
        !self.has_mn_task() && !self.is_stopping()
    }

    pub fn insert_sn_task(&mut self, task_id: TaskId, allocation: &Allocation) {
        match &mut self.assignment {
            WorkerAssignment::Sn(a) => {
                assert!(a.assign_tasks.insert(task_id));
            }
            WorkerAssignment::Mn(_) => panic!("Worker {} runs a multi-node task", self.id),
        }
        log::debug!(
            "Task {} reserved {:?} on worker {}",
            task_id,
            allocation,
            self.id
        );
    }

    /// Removes the task from the worker and returns its slice to the pool
    pub fn remove_sn_task(&mut self, task_id: TaskId, allocation: &Allocation) {
        match &mut self.assignment {
            WorkerAssignment::Sn(a) => {
                assert!(a.assign_tasks.remove(&task_id));
            }
            WorkerAssignment::Mn(_) => panic!("Worker {} runs a multi-node task", self.id),
        }
        self.pool.release(allocation);
    }

    pub fn set_stopping_flag(&mut self, value: bool) {
        self.flags.set(WorkerFlags::STOPPING, value);
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.contains(WorkerFlags::STOPPING)
    }

    pub fn remaining_time(&self, now: Instant) -> Option<Duration> {
        self.termination_time
            .map(|time| time.saturating_duration_since(now))
    }

    /// Checks the packing hint of a request against the remaining lifetime
    pub fn has_time_to_run(&self, min_time: TimeRequest, now: Instant) -> bool {
        if min_time.is_zero() {
            return true;
        }
        self.remaining_time(now)
            .is_none_or(|remaining| min_time <= remaining)
    }

    /// Can the worker start the request right now (single node)?
    pub fn is_capable_now(&self, request: &ResourceRequest, now: Instant) -> bool {
        self.accepts_sn_tasks()
            && self.has_time_to_run(request.min_time(), now)
            && self.pool.can_allocate(request)
    }

    pub fn is_heartbeat_lost(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }

    pub fn worker_runtime_info(&self, task_map: &TaskMap) -> WorkerRuntimeInfo {
        match &self.assignment {
            WorkerAssignment::Sn(a) => {
                let running_tasks = a
                    .assign_tasks
                    .iter()
                    .filter(|task_id| task_map.get_task(**task_id).is_running())
                    .count() as u32;
                WorkerRuntimeInfo::SingleNodeTasks {
                    assigned_tasks: a.assign_tasks.len() as u32,
                    running_tasks,
                }
            }
            WorkerAssignment::Mn(a) => WorkerRuntimeInfo::MultiNodeTask {
                task_id: a.task_id,
                main_node: !a.reservation_only,
            },
        }
    }

    pub fn worker_info(&self, task_map: &TaskMap) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            configuration: self.configuration.clone(),
            runtime: self.worker_runtime_info(task_map),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::internal::common::resources::ResourceDescriptor;
    use crate::internal::tests::utils::env::create_test_worker_config;
    use crate::internal::tests::utils::resources::{ResBuilder, cpus_compact};
    use crate::{TaskId, WorkerId};
    use std::time::{Duration, Instant};

    use super::Worker;

    fn make_worker(n_cpus: u32, time_limit: Option<Duration>, now: Instant) -> Worker {
        let mut config = create_test_worker_config(ResourceDescriptor::simple_cpus(n_cpus));
        config.time_limit = time_limit;
        let map = crate::internal::common::resources::GlobalResourceMapping::default()
            .create_resource_id_map();
        Worker::new(WorkerId::new(1), config, &map, now)
    }

    #[test]
    fn worker_min_time_hint() {
        let now = Instant::now();
        let worker = make_worker(4, Some(Duration::from_secs(100)), now);
        let short = ResBuilder::default()
            .add(0, 1)
            .min_time_secs(50)
            .finish();
        let long = ResBuilder::default()
            .add(0, 1)
            .min_time_secs(150)
            .finish();
        assert!(worker.is_capable_now(&short, now));
        assert!(!worker.is_capable_now(&long, now));
        assert!(!worker.is_capable_now(&short, now + Duration::from_secs(60)));
    }

    #[test]
    fn worker_without_time_limit_accepts_any_min_time() {
        let now = Instant::now();
        let worker = make_worker(4, None, now);
        let rq = ResBuilder::default().add(0, 1).min_time_secs(10_000).finish();
        assert!(worker.is_capable_now(&rq, now));
    }

    #[test]
    fn worker_sn_task_release() {
        let now = Instant::now();
        let mut worker = make_worker(4, None, now);
        let rq = cpus_compact(3).finish();
        let allocation = worker.pool.try_allocate(&rq).unwrap();
        worker.insert_sn_task(TaskId::new_test(1), &allocation);
        assert!(!worker.is_free());
        assert!(!worker.is_capable_now(&rq, now));
        worker.remove_sn_task(TaskId::new_test(1), &allocation);
        assert!(worker.is_free());
        assert!(worker.pool.is_fully_free());
    }

    #[test]
    fn worker_stopping_is_not_free() {
        let now = Instant::now();
        let mut worker = make_worker(2, None, now);
        worker.set_stopping_flag(true);
        assert!(!worker.is_free());
        assert!(!worker.is_capable_now(&cpus_compact(1).finish(), now));
    }
}
