use crate::internal::common::SortedVec;
use crate::internal::messages::common::{TaskFailInfo, TaskFailKind};
use crate::internal::server::comm::Comm;
use crate::internal::server::core::Core;
use crate::internal::server::task::Task;
use crate::TaskId;

/// Decides whether a failed instance gets another chance.
///
/// Losing the worker is never the task's fault, so such instances are always
/// requeued until the limit is reached. Failures of the task itself (and launch
/// errors) are retried only when the task asked for it.
pub(crate) fn should_retry(task: &Task, info: &TaskFailInfo) -> bool {
    let policy = &task.configuration.retry;
    let retryable = match info.kind {
        TaskFailKind::WorkerLost => true,
        TaskFailKind::TaskBody | TaskFailKind::LaunchError => policy.retry_on_failure,
    };
    retryable && task.retry_counter < policy.max_retries
}

/// Handles a failed instance of a task that is no longer bound to any worker.
pub(crate) fn on_failed_instance(
    core: &mut Core,
    comm: &mut impl Comm,
    task_id: TaskId,
    info: TaskFailInfo,
) {
    let task = core.get_task_mut(task_id);
    debug_assert!(task.assignment().is_none());
    if should_retry(task, &info) {
        task.retry_counter += 1;
        task.increment_instance_id();
        let instance_id = task.instance_id;
        log::debug!(
            "Task {} failed ({}), retry {}/{} as instance {}",
            task_id,
            info.kind,
            task.retry_counter,
            task.configuration.retry.max_retries,
            instance_id
        );
        core.set_task_ready(task_id);
        comm.client().on_task_retry(task_id, instance_id, &info);
        comm.ask_for_scheduling();
    } else {
        fail_task(core, comm, task_id, info);
    }
}

/// Final failure: the task and everything that (transitively) depends on it
/// leaves the engine.
pub(crate) fn fail_task(core: &mut Core, comm: &mut impl Comm, task_id: TaskId, info: TaskFailInfo) {
    let consumers = core
        .get_task(task_id)
        .collect_consumers(core.task_map())
        .to_sorted_vec();
    log::debug!(
        "Task {} failed: {}, canceling {} consumers",
        task_id,
        info.message,
        consumers.len()
    );
    for consumer in &consumers {
        let task = core.remove_task(*consumer);
        assert!(task.is_waiting());
    }
    let _ = core.remove_task(task_id);
    comm.client().on_task_error(task_id, consumers, info);
    comm.ask_for_scheduling();
}
