use crate::internal::messages::common::TaskFailInfo;
use crate::internal::messages::worker::{TaskFailedMsg, TaskInstanceMsg, TaskRunningMsg};
use crate::internal::server::core::Core;
use crate::internal::server::reactor::{
    on_new_tasks, on_task_canceled, on_task_error, on_task_finished, on_task_running,
};
use crate::internal::server::task::Task;
use crate::internal::tests::utils::env::TestComm;
use crate::TaskId;

pub fn submit_test_tasks(core: &mut Core, tasks: Vec<Task>) {
    on_new_tasks(core, &mut TestComm::default(), tasks);
}

fn current_instance(core: &Core, task_id: TaskId) -> TaskInstanceMsg {
    let task = core.get_task(task_id);
    TaskInstanceMsg {
        id: task_id,
        instance_id: task.instance_id,
    }
}

fn root_worker(core: &Core, task_id: TaskId) -> crate::WorkerId {
    core.get_task(task_id)
        .assignment()
        .unwrap_or_else(|| panic!("Task {task_id} is not assigned"))
        .root_worker()
}

pub fn start_on_worker(core: &mut Core, comm: &mut TestComm, task_id: TaskId) {
    let worker_id = root_worker(core, task_id);
    let msg = current_instance(core, task_id);
    on_task_running(
        core,
        comm,
        worker_id,
        TaskRunningMsg {
            id: msg.id,
            instance_id: msg.instance_id,
        },
    );
    core.sanity_check();
}

pub fn finish_on_worker(core: &mut Core, comm: &mut TestComm, task_id: TaskId) {
    let worker_id = root_worker(core, task_id);
    let msg = current_instance(core, task_id);
    on_task_finished(core, comm, worker_id, msg);
    core.sanity_check();
}

pub fn fail_on_worker(core: &mut Core, comm: &mut TestComm, task_id: TaskId, info: TaskFailInfo) {
    let worker_id = root_worker(core, task_id);
    let msg = current_instance(core, task_id);
    on_task_error(
        core,
        comm,
        worker_id,
        TaskFailedMsg {
            id: msg.id,
            instance_id: msg.instance_id,
            info,
        },
    );
    core.sanity_check();
}

pub fn cancel_ack_on_worker(core: &mut Core, comm: &mut TestComm, task_id: TaskId) {
    let worker_id = root_worker(core, task_id);
    let msg = current_instance(core, task_id);
    on_task_canceled(core, comm, worker_id, msg);
    core.sanity_check();
}
