use std::time::Duration;

use crate::gateway::{
    LostWorkerReason, ResourceRequest, ResourceRequestEntry, SharedTaskConfiguration,
    TaskConfiguration, TaskSubmit,
};
use crate::internal::messages::worker::{STDOUT_CHANNEL, TaskOutputMsg, TaskRunningMsg};
use crate::internal::server::client::handle_new_tasks;
use crate::internal::server::reactor::{on_task_output, on_task_running};
use crate::internal::tests::utils::env::TestEnv;
use crate::internal::tests::utils::task::TaskBuilder;
use crate::resources::{AllocationRequest, ResourceAmount};
use crate::{InstanceId, Map, TaskId};

fn submit_entry(id: u32, deps: &[u32]) -> TaskConfiguration {
    TaskConfiguration {
        id: TaskId::new_test(id),
        shared_data_index: 0,
        task_deps: deps.iter().map(|d| TaskId::new_test(*d)).collect(),
        body: Box::new([]),
    }
}

fn submit(tasks: Vec<TaskConfiguration>) -> TaskSubmit {
    TaskSubmit {
        tasks,
        shared_data: vec![SharedTaskConfiguration::default()],
        adjust_instance_id: Map::default(),
    }
}

fn handle(rt: &mut TestEnv, msg: TaskSubmit) -> crate::Result<()> {
    let (core, comm) = rt.core_and_comm();
    handle_new_tasks(core, comm, msg)
}

#[test]
fn test_dependencies_release_consumers() {
    let mut rt = TestEnv::new();
    rt.new_workers(&[4]);
    let a = rt.new_task(TaskBuilder::new(1));
    let b = rt.new_task(TaskBuilder::new(2));
    let c = rt.new_task(TaskBuilder::new(3).task_deps(&[a, b]));
    let d = rt.new_task(TaskBuilder::new(4).task_deps(&[c]));
    rt.core().assert_waiting(&[c, d]);
    assert_eq!(rt.task(c).get_unfinished_deps(), 2);

    rt.schedule();
    rt.start(a);
    rt.finish(a);
    rt.core().assert_waiting(&[c]);
    rt.start(b);
    rt.finish(b);
    rt.core().assert_ready(&[c]);
    rt.core().assert_waiting(&[d]);
    assert_eq!(rt.comm().take_client_task_finished(2), vec![a, b]);
    assert!(rt.comm().need_scheduling);

    rt.schedule();
    rt.start(c);
    rt.finish(c);
    rt.core().assert_ready(&[d]);
}

#[test]
fn test_ready_and_assigned_are_reported() {
    let mut rt = TestEnv::new();
    let w = rt.new_workers(&[4])[0];
    handle(&mut rt, submit(vec![submit_entry(1, &[]), submit_entry(2, &[1])])).unwrap();
    let (a, b) = (TaskId::new_test(1), TaskId::new_test(2));
    assert_eq!(rt.comm().take_client_task_ready(), vec![a]);

    rt.schedule();
    assert_eq!(
        rt.comm().take_client_task_assigned(),
        vec![(a, InstanceId::new(0), vec![w])]
    );
    rt.start(a);
    rt.finish(a);
    assert_eq!(rt.comm().take_client_task_ready(), vec![b]);
    rt.schedule();
    assert_eq!(rt.comm().take_client_task_assigned().len(), 1);
}

#[test]
fn test_withdrawn_assignment_is_reported_as_ready() {
    let mut rt = TestEnv::new();
    let w = rt.new_workers(&[1])[0];
    let t = rt.new_task(TaskBuilder::new(1));
    rt.schedule();
    assert_eq!(rt.comm().take_client_task_assigned().len(), 1);

    rt.lose_worker(w, LostWorkerReason::Stopped);
    assert_eq!(rt.comm().take_client_task_ready(), vec![t]);
    assert!(rt.comm().client_task_retries.is_empty());
    rt.core().assert_ready(&[t]);
}

#[test]
fn test_running_is_reported_once() {
    let mut rt = TestEnv::new();
    let w = rt.new_workers(&[1])[0];
    let t = rt.new_task(TaskBuilder::new(1));
    rt.schedule();
    rt.start(t);
    let started = rt.comm().take_client_task_started(1);
    assert_eq!(started, vec![(t, InstanceId::new(0), vec![w])]);

    let (core, comm) = rt.core_and_comm();
    on_task_running(
        core,
        comm,
        w,
        TaskRunningMsg {
            id: t,
            instance_id: InstanceId::new(0),
        },
    );
    assert!(rt.comm().client_task_started.is_empty());
    rt.core().assert_running(&[t]);
}

#[test]
fn test_report_from_foreign_worker_is_ignored() {
    let mut rt = TestEnv::new();
    let ws = rt.new_workers(&[1, 1]);
    let t = rt.new_task(TaskBuilder::new(1));
    rt.schedule();
    let other = if rt.assigned_worker(t) == ws[0] {
        ws[1]
    } else {
        ws[0]
    };
    let (core, comm) = rt.core_and_comm();
    on_task_running(
        core,
        comm,
        other,
        TaskRunningMsg {
            id: t,
            instance_id: InstanceId::new(0),
        },
    );
    rt.core().assert_assigned(&[t]);
}

#[test]
fn test_output_of_current_instance_is_forwarded() {
    let mut rt = TestEnv::new();
    let w = rt.new_workers(&[1])[0];
    let t = rt.new_task(TaskBuilder::new(1));
    rt.schedule();
    rt.start(t);

    let output = |instance: u32, data: &[u8], eof: bool| TaskOutputMsg {
        id: t,
        instance_id: InstanceId::new(instance),
        channel: STDOUT_CHANNEL,
        data: data.to_vec(),
        eof,
    };
    let (core, comm) = rt.core_and_comm();
    on_task_output(core, comm, w, output(0, b"hello\n", false));
    on_task_output(core, comm, w, output(3, b"stale\n", false));
    on_task_output(core, comm, w, output(0, b"", true));
    assert_eq!(
        rt.comm().client_outputs,
        vec![
            (t, InstanceId::new(0), STDOUT_CHANNEL, b"hello\n".to_vec(), false),
            (t, InstanceId::new(0), STDOUT_CHANNEL, Vec::new(), true),
        ]
    );
}

#[test]
fn test_submit_batch_in_any_order() {
    let mut rt = TestEnv::new();
    handle(
        &mut rt,
        submit(vec![submit_entry(3, &[1, 2]), submit_entry(2, &[1]), submit_entry(1, &[])]),
    )
    .unwrap();
    rt.core().assert_ready(&[TaskId::new_test(1)]);
    rt.core()
        .assert_waiting(&[TaskId::new_test(2), TaskId::new_test(3)]);
    assert_eq!(rt.task(TaskId::new_test(3)).get_unfinished_deps(), 2);
    rt.core().sanity_check();
}

#[test]
fn test_submit_cycle_is_rejected_without_side_effects() {
    let mut rt = TestEnv::new();
    let err = handle(
        &mut rt,
        submit(vec![
            submit_entry(1, &[3]),
            submit_entry(2, &[1]),
            submit_entry(3, &[2]),
            submit_entry(4, &[]),
        ]),
    )
    .unwrap_err();
    assert!(err.to_string().contains("cycle"));
    assert!(rt.core().task_map().is_empty());
}

#[test]
fn test_submit_invalid_batches() {
    let mut rt = TestEnv::new();
    handle(&mut rt, submit(vec![submit_entry(1, &[])])).unwrap();

    // Taken id
    assert!(handle(&mut rt, submit(vec![submit_entry(1, &[])])).is_err());
    // Duplicate id in one batch
    assert!(handle(&mut rt, submit(vec![submit_entry(2, &[]), submit_entry(2, &[])])).is_err());
    // Self dependency
    assert!(handle(&mut rt, submit(vec![submit_entry(3, &[3])])).is_err());
    // Wrong configuration index
    let mut msg = submit(vec![submit_entry(4, &[])]);
    msg.tasks[0].shared_data_index = 1;
    assert!(handle(&mut rt, msg).is_err());
    // Unknown resource kind
    let mut msg = submit(vec![submit_entry(5, &[])]);
    msg.shared_data[0].resources.resources[0].resource = "fpgas".to_string();
    assert!(handle(&mut rt, msg).is_err());
    // Zero amount
    let mut msg = submit(vec![submit_entry(6, &[])]);
    msg.shared_data[0].resources.resources[0].policy =
        AllocationRequest::Compact(ResourceAmount::ZERO);
    assert!(handle(&mut rt, msg).is_err());

    assert_eq!(rt.core().task_map().len(), 1);
}

#[test]
fn test_submit_restored_instance_ids() {
    let mut rt = TestEnv::new();
    let mut msg = submit(vec![submit_entry(1, &[])]);
    msg.adjust_instance_id
        .insert(TaskId::new_test(1), InstanceId::new(4));
    handle(&mut rt, msg).unwrap();
    assert_eq!(rt.task(TaskId::new_test(1)).instance_id, InstanceId::new(4));
}

#[test]
fn test_submit_while_halted() {
    let mut rt = TestEnv::new();
    rt.core().halt_dispatch();
    assert!(handle(&mut rt, submit(vec![submit_entry(1, &[])])).is_err());
    assert!(rt.core().task_map().is_empty());
}

#[test]
fn test_submit_shared_configuration() {
    let mut rt = TestEnv::new();
    let w = rt.new_workers(&[4])[0];
    let mut msg = submit((1..=3).map(|i| submit_entry(i, &[])).collect());
    msg.shared_data[0] = SharedTaskConfiguration {
        resources: ResourceRequest {
            n_nodes: 0,
            resources: smallvec::smallvec![ResourceRequestEntry {
                resource: "cpus".to_string(),
                policy: AllocationRequest::Compact(ResourceAmount::new(2)),
            }],
            min_time: Duration::ZERO,
        },
        time_limit: Some(Duration::from_secs(10)),
        priority: 3,
        retry: Default::default(),
    };
    handle(&mut rt, msg).unwrap();
    rt.schedule();
    let msgs = rt.comm().take_compute_msgs(w);
    assert_eq!(msgs.len(), 2);
    assert!(msgs
        .iter()
        .all(|m| m.user_priority == 3 && m.time_limit == Some(Duration::from_secs(10))));
}

#[test]
fn test_backlog_summary() {
    let mut rt = TestEnv::new();
    rt.new_workers(&[2, 2]);
    let mut msg = submit((1..=5).map(|i| submit_entry(i, &[])).collect());
    msg.tasks.push(submit_entry(6, &[1]));
    handle(&mut rt, msg).unwrap();
    rt.new_task(TaskBuilder::new(7).cpus_compact(2));
    rt.schedule();

    let summary = rt.core().backlog_summary();
    assert_eq!(summary.n_workers, 2);
    assert_eq!(summary.n_idle_workers, 0);
    assert_eq!(summary.n_waiting, 1);
    assert_eq!(summary.n_assigned_or_running, 4);
    assert_eq!(summary.n_ready, 2);
    assert_eq!(summary.shapes.len(), 2);
    assert_eq!(summary.shapes.iter().map(|s| s.n_tasks).sum::<u32>(), 2);
}
