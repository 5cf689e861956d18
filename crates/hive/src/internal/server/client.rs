use std::collections::VecDeque;
use std::rc::Rc;

use crate::gateway::{SharedTaskConfiguration, TaskSubmit};
use crate::internal::common::error::DsError;
use crate::internal::common::{Map, Set};
use crate::internal::server::comm::Comm;
use crate::internal::server::core::Core;
use crate::internal::server::reactor::on_new_tasks;
use crate::internal::server::task::{Task, TaskConfiguration};
use crate::TaskId;

fn create_task_configuration(
    core: &Core,
    msg: &SharedTaskConfiguration,
) -> crate::Result<TaskConfiguration> {
    msg.resources.validate()?;
    let resources = core.convert_client_resource_rq(&msg.resources)?;
    resources.validate()?;
    Ok(TaskConfiguration {
        resources,
        user_priority: msg.priority,
        time_limit: msg.time_limit,
        retry: msg.retry,
    })
}

/// Orders the batch so that dependencies precede their consumers.
/// Fails when the dependencies inside the batch form a cycle.
fn topological_order(tasks: &[Task]) -> crate::Result<Vec<usize>> {
    let index: Map<TaskId, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, task)| (task.id, i))
        .collect();
    let mut n_deps = vec![0u32; tasks.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        let unique: Set<TaskId> = task.task_deps.iter().copied().collect();
        for dep in unique {
            if let Some(&j) = index.get(&dep) {
                n_deps[i] += 1;
                consumers[j].push(i);
            }
        }
    }
    let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|i| n_deps[*i] == 0).collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &c in &consumers[i] {
            n_deps[c] -= 1;
            if n_deps[c] == 0 {
                queue.push_back(c);
            }
        }
    }
    if order.len() != tasks.len() {
        let in_cycle = (0..tasks.len())
            .filter(|i| n_deps[*i] > 0)
            .map(|i| tasks[i].id)
            .min()
            .unwrap_or_default();
        return Err(DsError::validation(format!(
            "Dependency cycle detected, task {in_cycle} (transitively) depends on itself"
        )));
    }
    Ok(order)
}

/// Validates a submission and inserts it into the engine; nothing is inserted on error.
pub(crate) fn handle_new_tasks(
    core: &mut Core,
    comm: &mut impl Comm,
    task_submit: TaskSubmit,
) -> crate::Result<()> {
    log::debug!("Client sends {} tasks", task_submit.tasks.len());
    if task_submit.tasks.is_empty() {
        return Ok(());
    }
    if core.is_dispatch_halted() {
        return Err("The server is halted, no new tasks are accepted".into());
    }

    let configurations: Vec<_> = task_submit
        .shared_data
        .iter()
        .map(|c| create_task_configuration(core, c).map(Rc::new))
        .collect::<crate::Result<_>>()?;

    let mut ids: Set<TaskId> = Set::with_capacity_and_hasher(task_submit.tasks.len(), Default::default());
    let mut tasks: Vec<Task> = Vec::with_capacity(task_submit.tasks.len());
    for task in task_submit.tasks {
        if core.find_task(task.id).is_some() || !ids.insert(task.id) {
            return Err(DsError::validation(format!("Task id={} is already taken", task.id)));
        }
        if task.task_deps.contains(&task.id) {
            return Err(DsError::validation(format!("Task {} depends on itself", task.id)));
        }
        let idx = task.shared_data_index as usize;
        let Some(conf) = configurations.get(idx) else {
            return Err(DsError::validation(format!("Invalid configuration index {idx}")));
        };
        let mut new_task = Task::new(task.id, task.task_deps, conf.clone(), task.body);
        if let Some(instance_id) = task_submit.adjust_instance_id.get(&task.id) {
            new_task.instance_id = *instance_id;
        }
        tasks.push(new_task);
    }

    let order = topological_order(&tasks)?;
    let mut slots: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
    let tasks: Vec<Task> = order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();
    on_new_tasks(core, comm, tasks);
    Ok(())
}
