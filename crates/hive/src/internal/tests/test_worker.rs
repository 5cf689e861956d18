use std::time::Duration;

use derive_builder::Builder;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tokio::time::timeout;

use crate::internal::common::error::DsError;
use crate::internal::common::resources::{
    Allocation, CPU_RESOURCE_ID, ResourceAllocation, ResourceAmount, ResourceDescriptor,
    ResourceIdMap, ResourceIndex,
};
use crate::internal::messages::common::TaskFailKind;
use crate::internal::messages::worker::{
    ComputeTaskMsg, FromWorkerMessage, MnReservationMsg, PeerReadyMsg, STDOUT_CHANNEL,
    TaskIdsMsg, TaskInstanceMsg, ToWorkerMessage,
};
use crate::internal::tests::utils::env::create_test_worker_config;
use crate::internal::worker::comm::WorkerComm;
use crate::internal::worker::reactor::process_worker_message;
use crate::internal::worker::state::WorkerStateRef;
use crate::launcher::{StopReason, TaskBuildContext, TaskFuture, TaskLauncher, TaskResult};
use crate::{InstanceId, TaskId, WorkerId};

/// Interprets the task body as a tiny command
struct TestLauncher;

impl TaskLauncher for TestLauncher {
    fn build_task(
        &self,
        ctx: TaskBuildContext,
        stop_receiver: oneshot::Receiver<StopReason>,
    ) -> crate::Result<TaskFuture> {
        let output = ctx.output_stream();
        match ctx.body() {
            b"ok" => Ok(Box::pin(async { Ok(TaskResult::Finished) })),
            b"fail" => Ok(Box::pin(async {
                Err(DsError::GenericError("boom".to_string()))
            })),
            b"wait" => Ok(Box::pin(async move {
                Ok(match stop_receiver.await {
                    Ok(reason) => reason.into(),
                    Err(_) => TaskResult::Canceled,
                })
            })),
            b"output" => Ok(Box::pin(async move {
                output.send_data(STDOUT_CHANNEL, b"hello world");
                output.close(STDOUT_CHANNEL);
                Ok(TaskResult::Finished)
            })),
            _ => Err("Cannot launch".into()),
        }
    }
}

fn create_state(max_output_chunk: usize) -> WorkerStateRef {
    let mut configuration = create_test_worker_config(ResourceDescriptor::simple_cpus(4));
    configuration.max_output_chunk = max_output_chunk;
    WorkerStateRef::new(
        WorkerComm::new_test_comm(),
        WorkerId::new(1),
        configuration,
        ResourceIdMap::from_vec(vec!["cpus".to_string()]),
        Box::new(TestLauncher),
        "test-uid".to_string(),
    )
}

/// Assignment of a task to the worker under test
#[derive(Builder)]
#[builder(pattern = "owned")]
struct ComputeSpec {
    id: u32,
    #[builder(default)]
    instance: u32,
    body: &'static [u8],
    /// Non-root workers of a multi-node task
    #[builder(default)]
    peers: Vec<u32>,
    /// Indices of the CPUs reserved for the task
    #[builder(default)]
    cpus: Vec<u32>,
    #[builder(default)]
    time_limit: Option<Duration>,
}

impl ComputeSpecBuilder {
    fn message(self) -> ToWorkerMessage {
        let spec = self.build().unwrap();
        let mut allocation = Allocation::new();
        if !spec.cpus.is_empty() {
            allocation.add_resource_allocation(ResourceAllocation {
                resource_id: CPU_RESOURCE_ID,
                amount: ResourceAmount::new(spec.cpus.len() as u64),
                indices: spec.cpus.iter().map(|c| ResourceIndex::new(*c)).collect(),
            });
        }
        ToWorkerMessage::ComputeTask(ComputeTaskMsg {
            id: TaskId::new_test(spec.id),
            instance_id: InstanceId::new(spec.instance),
            user_priority: 0,
            allocation,
            time_limit: spec.time_limit,
            node_list: Vec::new(),
            mn_peers: spec.peers.into_iter().map(WorkerId::new).collect(),
            body: spec.body.into(),
        })
    }
}

fn compute(id: u32, instance: u32, body: &'static [u8], peers: &[u32]) -> ToWorkerMessage {
    ComputeSpecBuilder::default()
        .id(id)
        .instance(instance)
        .body(body)
        .peers(peers.to_vec())
        .message()
}

fn compute_on_cpus(id: u32, body: &'static [u8], cpus: &[u32]) -> ToWorkerMessage {
    ComputeSpecBuilder::default()
        .id(id)
        .body(body)
        .cpus(cpus.to_vec())
        .message()
}

fn process(state_ref: &WorkerStateRef, message: ToWorkerMessage) -> bool {
    let mut state = state_ref.get_mut();
    process_worker_message(&mut state, state_ref, message)
}

fn take_messages(state_ref: &WorkerStateRef) -> Vec<FromWorkerMessage> {
    state_ref.get().comm().test().take_messages()
}

async fn wait_for_messages(state_ref: &WorkerStateRef, count: usize) -> Vec<FromWorkerMessage> {
    let mut messages = Vec::new();
    timeout(Duration::from_secs(5), async {
        while messages.len() < count {
            messages.extend(take_messages(state_ref));
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    messages
}

#[tokio::test]
async fn test_task_finishes() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            assert!(!process(&state, compute(1, 0, b"ok", &[])));
            let msgs = wait_for_messages(&state, 2).await;
            assert!(matches!(&msgs[0], FromWorkerMessage::TaskRunning(m) if m.id == TaskId::new_test(1)));
            assert!(matches!(
                &msgs[1],
                FromWorkerMessage::TaskFinished(TaskInstanceMsg { id, instance_id })
                    if *id == TaskId::new_test(1) && *instance_id == InstanceId::new(0)
            ));
            assert!(state.get().is_idle());
            assert_eq!(state.get().comm().test().empty_notifications, 1);
        })
        .await;
}

#[tokio::test]
async fn test_task_failure_is_reported() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 0, b"fail", &[]));
            let msgs = wait_for_messages(&state, 2).await;
            match &msgs[1] {
                FromWorkerMessage::TaskFailed(m) => {
                    assert_eq!(m.info.kind, TaskFailKind::TaskBody);
                    assert!(m.info.message.contains("boom"));
                }
                m => panic!("Unexpected message {m:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn test_launch_error_is_reported_without_start() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 0, b"???", &[]));
            let msgs = take_messages(&state);
            assert_eq!(msgs.len(), 1);
            assert!(matches!(
                &msgs[0],
                FromWorkerMessage::TaskFailed(m) if m.info.kind == TaskFailKind::LaunchError
            ));
            assert!(!state.get().has_tasks());
        })
        .await;
}

#[tokio::test]
async fn test_conflicting_allocation_is_rejected() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute_on_cpus(1, b"wait", &[0, 1]));
            wait_for_messages(&state, 1).await;
            assert_eq!(
                state.get().resource_pool().free_amount(CPU_RESOURCE_ID),
                ResourceAmount::new(2)
            );

            process(&state, compute_on_cpus(2, b"ok", &[1, 2]));
            let msgs = take_messages(&state);
            assert_eq!(msgs.len(), 1);
            assert!(matches!(
                &msgs[0],
                FromWorkerMessage::TaskFailed(m)
                    if m.id == TaskId::new_test(2) && m.info.kind == TaskFailKind::LaunchError
            ));
            assert_eq!(state.get().running_task_ids(), vec![TaskId::new_test(1)]);
            assert!(state.get().find_task(TaskId::new_test(2)).is_none());

            // Disjoint slice is accepted
            process(&state, compute_on_cpus(3, b"ok", &[2, 3]));
            let msgs = wait_for_messages(&state, 2).await;
            assert!(matches!(&msgs[1], FromWorkerMessage::TaskFinished(m) if m.id == TaskId::new_test(3)));
        })
        .await;
}

#[tokio::test]
async fn test_allocation_is_released_when_task_ends() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute_on_cpus(1, b"wait", &[0, 1, 2, 3]));
            wait_for_messages(&state, 1).await;
            assert!(state.get().resource_pool().free_amount(CPU_RESOURCE_ID).is_zero());

            process(
                &state,
                ToWorkerMessage::CancelTasks(TaskIdsMsg {
                    ids: vec![TaskId::new_test(1)],
                }),
            );
            wait_for_messages(&state, 1).await;
            assert!(state.get().resource_pool().is_fully_free());

            process(&state, compute_on_cpus(2, b"ok", &[0, 1, 2, 3]));
            let msgs = wait_for_messages(&state, 2).await;
            assert!(matches!(&msgs[1], FromWorkerMessage::TaskFinished(m) if m.id == TaskId::new_test(2)));
            assert!(state.get().resource_pool().is_fully_free());
        })
        .await;
}

#[tokio::test]
async fn test_cancel_running_task() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 0, b"wait", &[]));
            wait_for_messages(&state, 1).await;
            assert_eq!(state.get().running_task_ids(), vec![TaskId::new_test(1)]);

            process(
                &state,
                ToWorkerMessage::CancelTasks(TaskIdsMsg {
                    ids: vec![TaskId::new_test(1), TaskId::new_test(2)],
                }),
            );
            let msgs = wait_for_messages(&state, 1).await;
            assert_eq!(msgs.len(), 1);
            assert!(matches!(&msgs[0], FromWorkerMessage::TaskCanceled(m) if m.id == TaskId::new_test(1)));
            assert!(!state.get().has_tasks());
        })
        .await;
}

#[tokio::test]
async fn test_cancel_task_waiting_for_peers() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 0, b"ok", &[2]));
            assert!(take_messages(&state).is_empty());
            process(
                &state,
                ToWorkerMessage::CancelTasks(TaskIdsMsg {
                    ids: vec![TaskId::new_test(1)],
                }),
            );
            let msgs = take_messages(&state);
            assert_eq!(msgs.len(), 1);
            assert!(matches!(&msgs[0], FromWorkerMessage::TaskCanceled(_)));
        })
        .await;
}

#[tokio::test]
async fn test_time_limit_fails_task() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            let msg = ComputeSpecBuilder::default()
                .id(1)
                .body(b"wait")
                .time_limit(Some(Duration::from_millis(30)))
                .message();
            process(&state, msg);
            let msgs = wait_for_messages(&state, 2).await;
            match &msgs[1] {
                FromWorkerMessage::TaskFailed(m) => {
                    assert_eq!(m.info.kind, TaskFailKind::TaskBody);
                    assert_eq!(m.info.message, "Time limit reached");
                }
                m => panic!("Unexpected message {m:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn test_multinode_root_waits_for_peers() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 2, b"ok", &[2, 3]));
            let peer_ready = |instance: u32, worker: u32| {
                ToWorkerMessage::PeerReady(PeerReadyMsg {
                    id: TaskId::new_test(1),
                    instance_id: InstanceId::new(instance),
                    worker_id: WorkerId::new(worker),
                })
            };
            process(&state, peer_ready(2, 2));
            // Confirmation for an older instance does not count
            process(&state, peer_ready(1, 3));
            assert!(take_messages(&state).is_empty());
            assert!(state.get().running_task_ids().is_empty());

            process(&state, peer_ready(2, 3));
            let msgs = wait_for_messages(&state, 2).await;
            assert!(matches!(&msgs[0], FromWorkerMessage::TaskRunning(_)));
            assert!(matches!(&msgs[1], FromWorkerMessage::TaskFinished(_)));
        })
        .await;
}

#[tokio::test]
async fn test_reservation_keeps_worker_busy() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(
                &state,
                ToWorkerMessage::ReserveForTask(MnReservationMsg {
                    id: TaskId::new_test(7),
                    instance_id: InstanceId::new(0),
                    root: WorkerId::new(2),
                }),
            );
            let msgs = take_messages(&state);
            assert!(matches!(
                &msgs[..],
                [FromWorkerMessage::PeerReady(TaskInstanceMsg { id, .. })] if *id == TaskId::new_test(7)
            ));
            assert!(!state.get().is_idle());

            // Release for a different task is ignored
            let release = |id: u32| {
                ToWorkerMessage::ReleaseReservation(TaskInstanceMsg {
                    id: TaskId::new_test(id),
                    instance_id: InstanceId::new(0),
                })
            };
            process(&state, release(8));
            assert!(!state.get().is_idle());
            process(&state, release(7));
            assert!(state.get().is_idle());
        })
        .await;
}

#[tokio::test]
async fn test_stale_instance_does_not_remove_new_one() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 0, b"wait", &[]));
            wait_for_messages(&state, 1).await;

            // The server already gave up on instance 0 and sends instance 1
            process(&state, compute(1, 1, b"wait", &[]));
            let msgs = wait_for_messages(&state, 1).await;
            assert!(matches!(
                &msgs[..],
                [FromWorkerMessage::TaskRunning(m)] if m.instance_id == InstanceId::new(1)
            ));
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            assert!(take_messages(&state).is_empty());
            assert_eq!(state.get().running_task_ids(), vec![TaskId::new_test(1)]);
        })
        .await;
}

#[tokio::test]
async fn test_output_is_chunked() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(4);
            process(&state, compute(1, 0, b"output", &[]));
            let msgs = wait_for_messages(&state, 6).await;
            let outputs: Vec<(Vec<u8>, bool)> = msgs
                .iter()
                .filter_map(|m| match m {
                    FromWorkerMessage::TaskOutput(o) => {
                        assert_eq!(o.channel, STDOUT_CHANNEL);
                        Some((o.data.clone(), o.eof))
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(
                outputs,
                vec![
                    (b"hell".to_vec(), false),
                    (b"o wo".to_vec(), false),
                    (b"rld".to_vec(), false),
                    (Vec::new(), true),
                ]
            );
            assert!(matches!(msgs.last(), Some(FromWorkerMessage::TaskFinished(_))));
        })
        .await;
}

#[tokio::test]
async fn test_stop_message() {
    LocalSet::new()
        .run_until(async {
            let state = create_state(64);
            process(&state, compute(1, 0, b"wait", &[]));
            wait_for_messages(&state, 1).await;
            assert!(process(&state, ToWorkerMessage::Stop));
            state.get_mut().cancel_all_tasks();
            let msgs = wait_for_messages(&state, 1).await;
            assert!(matches!(&msgs[0], FromWorkerMessage::TaskCanceled(_)));
        })
        .await;
}
