use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use thin_vec::ThinVec;

use crate::gateway::RetryPolicy;
use crate::internal::common::Set;
use crate::internal::common::resources::{Allocation, ResourceRequest};
use crate::internal::messages::worker::{ComputeTaskMsg, ToWorkerMessage};
use crate::internal::server::taskmap::TaskMap;
use crate::{InstanceId, Priority, TaskId, WorkerId};

#[cfg_attr(test, derive(Eq, PartialEq))]
pub struct WaitingInfo {
    pub unfinished_deps: u32,
}

/// Binding of a task to worker(s) together with the reserved resources.
#[derive(Debug)]
#[cfg_attr(test, derive(Eq, PartialEq))]
pub enum Assignment {
    Single {
        worker_id: WorkerId,
        allocation: Box<Allocation>,
    },
    // The first worker is the root node where the command is executed, others are reserved
    Multi { workers: Vec<WorkerId> },
}

impl Assignment {
    pub fn worker_ids(&self) -> &[WorkerId] {
        match self {
            Assignment::Single { worker_id, .. } => std::slice::from_ref(worker_id),
            Assignment::Multi { workers } => workers,
        }
    }

    pub fn root_worker(&self) -> WorkerId {
        self.worker_ids()[0]
    }
}

#[cfg_attr(test, derive(Eq, PartialEq))]
pub enum TaskRuntimeState {
    Waiting(WaitingInfo),
    Ready,
    Assigned(Assignment),
    Running(Assignment),
}

impl fmt::Debug for TaskRuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting(info) => write!(f, "W({})", info.unfinished_deps),
            Self::Ready => write!(f, "Q"),
            Self::Assigned(a) => write!(f, "A({:?})", a.worker_ids()),
            Self::Running(a) => write!(f, "R({:?})", a.worker_ids()),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TaskFlags: u32 {
        // Cancel was sent to the worker(s), waiting for an acknowledgement
        const CANCELING = 0b00000001;
    }
}

#[derive(Debug)]
#[cfg_attr(test, derive(Eq, PartialEq))]
pub struct TaskConfiguration {
    pub resources: ResourceRequest,
    pub user_priority: Priority,
    pub time_limit: Option<Duration>,
    pub retry: RetryPolicy,
}

pub struct Task {
    pub id: TaskId,
    pub state: TaskRuntimeState,
    consumers: Set<TaskId>,
    pub task_deps: ThinVec<TaskId>,
    pub flags: TaskFlags,
    pub configuration: Rc<TaskConfiguration>,
    pub instance_id: InstanceId,
    pub retry_counter: u32,
    /// Position in the submission order, tie-breaker of equal priorities
    pub submit_seq: u64,
    pub body: Box<[u8]>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("instance", &self.instance_id)
            .finish()
    }
}

impl Task {
    pub fn new(
        id: TaskId,
        dependencies: ThinVec<TaskId>,
        configuration: Rc<TaskConfiguration>,
        body: Box<[u8]>,
    ) -> Self {
        log::debug!("New task {} {}", id, &configuration.resources);
        Self {
            id,
            task_deps: dependencies,
            flags: TaskFlags::empty(),
            configuration,
            body,
            state: TaskRuntimeState::Waiting(WaitingInfo { unfinished_deps: 0 }),
            consumers: Default::default(),
            instance_id: InstanceId::new(0),
            retry_counter: 0,
            submit_seq: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.configuration.user_priority
    }

    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self.state, TaskRuntimeState::Waiting(_))
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, TaskRuntimeState::Ready)
    }

    #[inline]
    pub(crate) fn is_assigned(&self) -> bool {
        matches!(self.state, TaskRuntimeState::Assigned(_))
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        matches!(self.state, TaskRuntimeState::Running(_))
    }

    #[inline]
    pub(crate) fn assignment(&self) -> Option<&Assignment> {
        match &self.state {
            TaskRuntimeState::Assigned(a) | TaskRuntimeState::Running(a) => Some(a),
            TaskRuntimeState::Waiting(_) | TaskRuntimeState::Ready => None,
        }
    }

    #[inline]
    pub(crate) fn is_canceling(&self) -> bool {
        self.flags.contains(TaskFlags::CANCELING)
    }

    #[inline]
    pub(crate) fn set_canceling_flag(&mut self, value: bool) {
        self.flags.set(TaskFlags::CANCELING, value);
    }

    /// Returns true when the last dependency was finished
    #[inline]
    pub(crate) fn decrease_unfinished_deps(&mut self) -> bool {
        match &mut self.state {
            TaskRuntimeState::Waiting(WaitingInfo { unfinished_deps }) if *unfinished_deps > 0 => {
                *unfinished_deps -= 1;
                *unfinished_deps == 0
            }
            _ => panic!("Invalid state of task {}: {:?}", self.id, self.state),
        }
    }

    #[inline]
    pub(crate) fn add_consumer(&mut self, consumer: TaskId) -> bool {
        self.consumers.insert(consumer)
    }

    #[inline]
    pub(crate) fn remove_consumer(&mut self, consumer: TaskId) -> bool {
        self.consumers.remove(&consumer)
    }

    #[inline]
    pub(crate) fn get_consumers(&self) -> &Set<TaskId> {
        &self.consumers
    }

    /// All tasks that (transitively) depend on this task
    pub(crate) fn collect_consumers(&self, taskmap: &TaskMap) -> Set<TaskId> {
        let mut stack: Vec<_> = self.consumers.iter().copied().collect();
        let mut result: Set<TaskId> = stack.iter().copied().collect();

        while let Some(task_id) = stack.pop() {
            let task = taskmap.get_task(task_id);
            for &consumer_id in &task.consumers {
                if result.insert(consumer_id) {
                    stack.push(consumer_id);
                }
            }
        }
        result
    }

    pub(crate) fn increment_instance_id(&mut self) {
        self.instance_id = InstanceId::new(self.instance_id.as_num() + 1);
    }

    pub(crate) fn make_compute_message(
        &self,
        allocation: Allocation,
        node_list: Vec<String>,
        mn_peers: Vec<WorkerId>,
    ) -> ToWorkerMessage {
        ToWorkerMessage::ComputeTask(ComputeTaskMsg {
            id: self.id,
            instance_id: self.instance_id,
            user_priority: self.configuration.user_priority,
            allocation,
            time_limit: self.configuration.time_limit,
            node_list,
            mn_peers,
            body: self.body.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::internal::common::SortedVec;
    use crate::internal::server::core::Core;
    use crate::internal::server::task::{Task, TaskRuntimeState};
    use crate::internal::tests::utils::schedule::submit_test_tasks;
    use crate::internal::tests::utils::task;
    use crate::internal::tests::utils::task::task_with_deps;

    impl Task {
        pub fn get_unfinished_deps(&self) -> u32 {
            match &self.state {
                TaskRuntimeState::Waiting(winfo) => winfo.unfinished_deps,
                _ => panic!("Invalid state"),
            }
        }
    }

    #[test]
    fn task_consumers_empty() {
        let a = task::task(0);
        assert!(a.collect_consumers(&Default::default()).is_empty());
    }

    #[test]
    fn task_recursive_consumers() {
        let mut core = Core::default();
        let a = task::task(0);
        let b = task_with_deps(1, &[&a]);
        let c = task_with_deps(2, &[&b]);
        let d = task_with_deps(3, &[&b]);
        let e = task_with_deps(4, &[&c, &d]);

        let expected_ids = vec![b.id, c.id, d.id, e.id];
        submit_test_tasks(&mut core, vec![a, b, c, d, e]);

        assert_eq!(
            core.get_task(0.into())
                .collect_consumers(core.task_map())
                .to_sorted_vec(),
            expected_ids
        );
    }

    #[test]
    fn task_unfinished_deps_after_submit() {
        let mut core = Core::default();
        let a = task::task(0);
        let b = task::task(1);
        let c = task_with_deps(2, &[&a, &b]);
        submit_test_tasks(&mut core, vec![a, b, c]);
        assert!(core.get_task(0.into()).is_ready());
        assert_eq!(core.get_task(2.into()).get_unfinished_deps(), 2);
    }
}
