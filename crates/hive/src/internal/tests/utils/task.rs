use super::resources::ResBuilder;
use crate::gateway::RetryPolicy;
use crate::internal::common::resources::NumOfNodes;
use crate::internal::server::task::{Task, TaskConfiguration};
use crate::{Priority, TaskId};
use std::rc::Rc;
use std::time::Duration;
use thin_vec::ThinVec;

pub struct TaskBuilder {
    id: TaskId,
    task_deps: ThinVec<TaskId>,
    resources_builder: ResBuilder,
    user_priority: Priority,
    time_limit: Option<Duration>,
    retry: RetryPolicy,
    body: Box<[u8]>,
}

impl TaskBuilder {
    pub fn new<T: Into<TaskId>>(id: T) -> TaskBuilder {
        TaskBuilder {
            id: id.into(),
            task_deps: Default::default(),
            resources_builder: Default::default(),
            user_priority: 0,
            time_limit: None,
            retry: RetryPolicy::default(),
            body: Default::default(),
        }
    }

    pub fn user_priority(mut self, value: Priority) -> TaskBuilder {
        self.user_priority = value;
        self
    }

    pub fn task_deps(mut self, deps: &[TaskId]) -> TaskBuilder {
        self.task_deps = deps.iter().copied().collect();
        self
    }

    pub fn resources(mut self, resources: ResBuilder) -> TaskBuilder {
        self.resources_builder = resources;
        self
    }

    pub fn n_nodes(mut self, count: NumOfNodes) -> TaskBuilder {
        self.resources_builder = ResBuilder::default().n_nodes(count);
        self
    }

    pub fn cpus_compact(mut self, count: u64) -> TaskBuilder {
        self.resources_builder = self.resources_builder.add(0, count);
        self
    }

    pub fn time_request(mut self, time_s: u64) -> TaskBuilder {
        self.resources_builder = self.resources_builder.min_time_secs(time_s);
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> TaskBuilder {
        self.time_limit = Some(limit);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> TaskBuilder {
        self.retry = retry;
        self
    }

    pub fn body(mut self, body: &[u8]) -> TaskBuilder {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Task {
        let mut builder = self.resources_builder;
        if builder.is_empty() {
            builder = builder.add(0, 1);
        }
        let resources = builder.finish();
        resources.validate().unwrap();
        Task::new(
            self.id,
            self.task_deps,
            Rc::new(TaskConfiguration {
                resources,
                user_priority: self.user_priority,
                time_limit: self.time_limit,
                retry: self.retry,
            }),
            self.body,
        )
    }
}

pub fn task<T: Into<TaskId>>(id: T) -> Task {
    TaskBuilder::new(id).build()
}

pub fn task_with_deps<T: Into<TaskId>>(id: T, deps: &[&Task]) -> Task {
    let deps: Vec<TaskId> = deps.iter().map(|t| t.id).collect();
    TaskBuilder::new(id).task_deps(&deps).build()
}
