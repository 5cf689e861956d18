use crate::TaskId;
use crate::internal::common::Map;
use crate::internal::server::task::Task;

/// Every task the server knows about, from submission until it is finished, failed or canceled.
///
/// Unknown ids passed to the panicking accessors are engine bugs, not user errors.
#[derive(Default, Debug)]
pub struct TaskMap {
    tasks: Map<TaskId, Task>,
}

impl TaskMap {
    /// Stores a freshly submitted task. Task ids are unique for the lifetime of the server.
    pub fn register(&mut self, task: Task) {
        let task_id = task.id;
        if self.tasks.insert(task_id, task).is_some() {
            panic!("Task {task_id} registered twice");
        }
    }

    /// Takes a task out of the map; its consumers keep their links
    pub fn take(&mut self, task_id: TaskId) -> Task {
        self.tasks
            .remove(&task_id)
            .unwrap_or_else(|| panic!("Task {task_id} cannot be removed, it is not registered"))
    }

    pub fn get_task(&self, task_id: TaskId) -> &Task {
        match self.tasks.get(&task_id) {
            Some(task) => task,
            None => panic!("Task {task_id} is not registered"),
        }
    }

    pub fn get_task_mut(&mut self, task_id: TaskId) -> &mut Task {
        match self.tasks.get_mut(&task_id) {
            Some(task) => task,
            None => panic!("Task {task_id} is not registered"),
        }
    }

    #[inline]
    pub fn find_task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    #[inline]
    pub fn find_task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&task_id)
    }

    /// Drops `consumer` from the consumer sets of those `inputs` that are still registered
    pub fn unlink_consumer(&mut self, consumer: TaskId, inputs: &[TaskId]) {
        for input_id in inputs {
            if let Some(input) = self.tasks.get_mut(input_id) {
                input.remove_consumer(consumer);
            }
        }
    }

    /// How many of `task_ids` are still registered, i.e. not finished yet
    pub fn count_registered(&self, task_ids: &[TaskId]) -> usize {
        task_ids
            .iter()
            .filter(|task_id| self.tasks.contains_key(*task_id))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
