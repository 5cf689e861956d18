use std::fmt::Debug;
use std::sync::Arc;

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hive::TaskGroup;
use orion::aead::SecretKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::common::error::TaskhiveError;
use crate::server::Senders;
use crate::server::job::Job;
use crate::server::state::{State, StateRef};
use crate::stream::{AttachedStream, StreamKey};
use crate::transfer::connection::ServerConnection;
use crate::transfer::messages::{
    CancelJobResponse, CloseJobResponse, ForgetJobResponse, FromClientMessage, IdSelector,
    JobInfoResponse, JobListRequest, JobSpec, JobStatus, StopWorkerResponse,
    StreamAttachRequest, StreamEvent, TaskListRequest, TaskListResponse, ToClientMessage,
    WaitForJobsResponse, WorkerListResponse,
};
use crate::{InstanceId, JobId, JobTaskCount, TaskId, WorkerId};

mod submit;

pub(crate) use submit::{build_task_submit, job_task_ids};

pub async fn handle_client_connections(
    listener: TcpListener,
    state_ref: StateRef,
    senders: &Senders,
    end_flag: Arc<Notify>,
    key: Option<Arc<SecretKey>>,
) {
    let group = TaskGroup::default();
    while let Ok((connection, address)) = group.run_until(listener.accept()).await {
        log::debug!("Client connected from {address}");
        let state_ref = state_ref.clone();
        let senders = senders.clone();
        let end_flag = end_flag.clone();
        let key = key.clone();

        group.add_task(async move {
            if let Err(e) = handle_client(connection, state_ref, &senders, end_flag, key).await {
                log::error!("Client error: {e}");
            }
        });
    }
}

async fn handle_client(
    socket: TcpStream,
    state_ref: StateRef,
    senders: &Senders,
    end_flag: Arc<Notify>,
    key: Option<Arc<SecretKey>>,
) -> crate::Result<()> {
    let connection = ServerConnection::accept_client(socket, key).await?;
    let (tx, rx) = connection.split();

    client_rpc_loop(tx, rx, state_ref, senders, end_flag).await;
    log::debug!("Client connection ended");
    Ok(())
}

pub async fn client_rpc_loop<
    Tx: Sink<ToClientMessage, Error = TaskhiveError> + Unpin + 'static,
    Rx: Stream<Item = crate::Result<FromClientMessage>> + Unpin,
>(
    mut tx: Tx,
    mut rx: Rx,
    state_ref: StateRef,
    senders: &Senders,
    end_flag: Arc<Notify>,
) where
    Tx::Error: Debug,
{
    while let Some(message_result) = rx.next().await {
        match message_result {
            Ok(message) => {
                let response = match message {
                    FromClientMessage::Submit(msg) => {
                        submit::handle_submit(&state_ref, senders, msg)
                    }
                    FromClientMessage::OpenJob(msg) => {
                        handle_open_job(&state_ref, senders, msg.spec)
                    }
                    FromClientMessage::CloseJob(msg) => {
                        handle_close_job(&state_ref, senders, &msg.selector)
                    }
                    FromClientMessage::JobInfo(msg) => compute_job_info(&state_ref, &msg.selector),
                    FromClientMessage::JobList(msg) => handle_job_list(&state_ref, &msg),
                    FromClientMessage::TaskList(msg) => handle_task_list(&state_ref, &msg),
                    FromClientMessage::Cancel(msg) => {
                        handle_job_cancel(&state_ref, senders, &msg.selector)
                    }
                    FromClientMessage::WaitForJobs(msg) => {
                        handle_wait_for_jobs_message(&state_ref, &msg.selector).await
                    }
                    FromClientMessage::ForgetJob(msg) => {
                        handle_job_forget(&state_ref, senders, &msg.selector)
                    }
                    FromClientMessage::StreamAttach(msg) => {
                        match attach_to_stream(&state_ref, senders, &msg) {
                            Ok(attached) => stream_output(&mut tx, &mut rx, attached).await,
                            Err(error) => {
                                let _ = tx.send(ToClientMessage::Error(error.to_string())).await;
                            }
                        }
                        break;
                    }
                    FromClientMessage::WorkerList => handle_worker_list(&state_ref, senders),
                    FromClientMessage::StopWorker(msg) => {
                        handle_worker_stop(&state_ref, senders, &msg.selector)
                    }
                    FromClientMessage::ServerDump => {
                        match serde_json::to_string_pretty(&senders.server_ref.dump()) {
                            Ok(dump) => ToClientMessage::ServerDump(dump),
                            Err(error) => ToClientMessage::Error(error.to_string()),
                        }
                    }
                    FromClientMessage::Stop => {
                        log::info!("Client asked the server to stop");
                        end_flag.notify_one();
                        break;
                    }
                };
                if let Err(error) = tx.send(response).await {
                    log::error!("Cannot reply to client: {error:?}");
                    break;
                }
            }
            Err(e) => {
                log::error!("Cannot parse client message: {e}");
                if tx
                    .send(ToClientMessage::Error(format!("Cannot parse message: {e}")))
                    .await
                    .is_err()
                {
                    log::error!(
                        "Cannot send error response to client, it has probably disconnected."
                    );
                }
            }
        }
    }
}

fn get_job_ids(state: &State, selector: &IdSelector) -> Vec<JobId> {
    match &selector {
        IdSelector::All => {
            let mut ids: Vec<JobId> = state.jobs().map(|job| job.job_id).collect();
            ids.sort_unstable();
            ids
        }
        IdSelector::LastN(n) => state.last_n_ids(*n).collect(),
        IdSelector::Specific(array) => array.iter().map(|id| id.into()).collect(),
    }
}

fn handle_open_job(state_ref: &StateRef, senders: &Senders, spec: JobSpec) -> ToClientMessage {
    let mut state = state_ref.get_mut();
    if let Some(reason) = state.halted_reason() {
        return ToClientMessage::Error(format!("Server does not accept new jobs: {reason}"));
    }
    let job_id = state.new_job_id();
    log::debug!("Opening job {job_id}");
    state.add_job(Job::new(job_id, spec.clone(), true));
    senders.events.on_job_opened(job_id, spec);
    ToClientMessage::OpenJobResponse(job_id)
}

fn close_job(job: &mut Job, senders: &Senders) -> CloseJobResponse {
    if !job.is_open {
        return CloseJobResponse::AlreadyClosed;
    }
    job.is_open = false;
    senders.events.on_job_closed(job.job_id);
    if job.check_termination(Utc::now()) {
        senders.events.on_job_completed(job.job_id);
    }
    CloseJobResponse::Closed
}

fn handle_close_job(
    state_ref: &StateRef,
    senders: &Senders,
    selector: &IdSelector,
) -> ToClientMessage {
    let mut state = state_ref.get_mut();
    let job_ids: Vec<JobId> = match selector {
        IdSelector::All => get_job_ids(&state, selector)
            .into_iter()
            .filter(|id| state.get_job(*id).is_some_and(|job| job.is_open))
            .collect(),
        _ => get_job_ids(&state, selector),
    };
    let responses = job_ids
        .into_iter()
        .map(|job_id| {
            let response = match state.get_job_mut(job_id) {
                Some(job) => close_job(job, senders),
                None => CloseJobResponse::InvalidJob,
            };
            (job_id, response)
        })
        .collect();
    ToClientMessage::CloseJobResponse(responses)
}

fn compute_job_info(state_ref: &StateRef, selector: &IdSelector) -> ToClientMessage {
    let state = state_ref.get();
    let jobs = get_job_ids(&state, selector)
        .into_iter()
        .filter_map(|id| state.get_job(id))
        .map(|job| job.make_job_info())
        .collect();
    ToClientMessage::JobInfoResponse(JobInfoResponse { jobs })
}

fn handle_job_list(state_ref: &StateRef, request: &JobListRequest) -> ToClientMessage {
    let state = state_ref.get();
    let mut jobs: Vec<_> = state
        .jobs()
        .filter(|job| {
            request
                .submitted_after
                .is_none_or(|date| job.submission_date >= date)
                && request
                    .submitted_before
                    .is_none_or(|date| job.submission_date < date)
        })
        .map(|job| job.make_job_info())
        .filter(|info| request.status.is_empty() || request.status.contains(&info.status))
        .collect();
    jobs.sort_unstable_by_key(|info| info.id);
    ToClientMessage::JobListResponse(JobInfoResponse { jobs })
}

fn handle_task_list(state_ref: &StateRef, request: &TaskListRequest) -> ToClientMessage {
    let state = state_ref.get();
    match state.get_job(request.job_id) {
        Some(job) => ToClientMessage::TaskListResponse(TaskListResponse {
            job_id: request.job_id,
            tasks: job.make_task_list(&request.status),
        }),
        None => ToClientMessage::Error(format!("Job {} not found", request.job_id)),
    }
}

fn handle_job_cancel(
    state_ref: &StateRef,
    senders: &Senders,
    selector: &IdSelector,
) -> ToClientMessage {
    let job_ids: Vec<JobId> = {
        let state = state_ref.get();
        match selector {
            IdSelector::All => get_job_ids(&state, selector)
                .into_iter()
                .filter(|id| state.get_job(*id).is_some_and(|job| !job.is_terminated()))
                .collect(),
            _ => get_job_ids(&state, selector),
        }
    };

    let responses = job_ids
        .into_iter()
        .map(|job_id| (job_id, cancel_job(state_ref, senders, job_id)))
        .collect();
    ToClientMessage::CancelJobResponse(responses)
}

fn cancel_job(state_ref: &StateRef, senders: &Senders, job_id: JobId) -> CancelJobResponse {
    let (task_ids, n_tasks): (Vec<TaskId>, JobTaskCount) = {
        let mut state = state_ref.get_mut();
        let Some(job) = state.get_job_mut(job_id) else {
            return CancelJobResponse::InvalidJob;
        };
        let task_ids = job.non_finished_task_ids();
        if !task_ids.is_empty() || job.is_open {
            job.cancel_requested = true;
        }
        if job.is_open {
            // A canceled job takes no further submissions
            job.is_open = false;
            senders.events.on_job_closed(job_id);
            if job.check_termination(Utc::now()) {
                senders.events.on_job_completed(job_id);
            }
        }
        (task_ids, job.n_tasks())
    };
    if task_ids.is_empty() {
        return CancelJobResponse::Canceled(Vec::new(), n_tasks);
    }

    // The engine reports canceled tasks back synchronously, so the state must not be borrowed here
    let removed = senders.server_ref.cancel_tasks(&task_ids);
    log::debug!(
        "Cancel of job {job_id}: {} task(s) removed, {} waiting for their workers",
        removed.len(),
        task_ids.len() - removed.len()
    );
    let already_finished = n_tasks - task_ids.len() as JobTaskCount;
    CancelJobResponse::Canceled(
        task_ids.iter().map(|id| id.job_task_id()).collect(),
        already_finished,
    )
}

/// Waits until all jobs matched by the `selector` are finished (either by completing successfully,
/// failing or being canceled).
async fn handle_wait_for_jobs_message(
    state_ref: &StateRef,
    selector: &IdSelector,
) -> ToClientMessage {
    let update_counters = |response: &mut WaitForJobsResponse, status: JobStatus| match status {
        JobStatus::Finished => response.finished += 1,
        JobStatus::Failed => response.failed += 1,
        JobStatus::Canceled => response.canceled += 1,
        JobStatus::Submitted | JobStatus::Running => {}
    };

    let (receivers, mut response) = {
        let mut state = state_ref.get_mut();
        let job_ids: Vec<JobId> = get_job_ids(&state, selector);

        let mut response = WaitForJobsResponse::default();
        let mut receivers = vec![];

        for job_id in job_ids {
            match state.get_job_mut(job_id) {
                Some(job) => {
                    if job.is_terminated() {
                        update_counters(&mut response, job.status());
                    } else {
                        receivers.push(job.subscribe_to_completion());
                    }
                }
                None => response.invalid += 1,
            }
        }
        (receivers, response)
    };

    let results = futures::future::join_all(receivers).await;
    let state = state_ref.get();
    for result in results {
        match result {
            Ok(job_id) => {
                if let Some(job) = state.get_job(job_id) {
                    update_counters(&mut response, job.status());
                }
            }
            Err(err) => log::error!("Error while waiting on job(s): {err:?}"),
        };
    }
    ToClientMessage::WaitForJobsResponse(response)
}

fn handle_job_forget(
    state_ref: &StateRef,
    senders: &Senders,
    selector: &IdSelector,
) -> ToClientMessage {
    let mut state = state_ref.get_mut();
    let job_ids: Vec<JobId> = get_job_ids(&state, selector);
    let mut response = ForgetJobResponse::default();

    for job_id in job_ids {
        let can_be_forgotten = state
            .get_job(job_id)
            .is_some_and(|job| job.is_terminated());
        if can_be_forgotten && state.forget_job(job_id).is_some() {
            senders.streams.get_mut().remove_job(job_id);
            senders.events.on_job_forgotten(job_id);
            response.forgotten += 1;
        } else {
            response.ignored += 1;
        }
    }
    ToClientMessage::ForgetJobResponse(response)
}

fn attach_to_stream(
    state_ref: &StateRef,
    senders: &Senders,
    request: &StreamAttachRequest,
) -> crate::Result<AttachedStream> {
    let task_id = TaskId::new(request.job_id, request.task_id);
    let (current_instance, is_terminal) = {
        let state = state_ref.get();
        let job = state
            .get_job(request.job_id)
            .ok_or_else(|| TaskhiveError::validation(format!("Job {} not found", request.job_id)))?;
        let task_state = job
            .get_task_state(request.task_id)
            .ok_or_else(|| TaskhiveError::validation(format!("Task {task_id} not found")))?;
        (task_state.instance_id(), task_state.is_terminal())
    };
    let mut streams = senders.streams.get_mut();
    let instance_id = request
        .instance_id
        .or(current_instance)
        .or_else(|| streams.latest_instance(task_id))
        .unwrap_or(InstanceId::new(0));
    let key = StreamKey {
        task_id,
        instance_id,
        channel: request.channel,
    };
    log::debug!(
        "Client attached to channel {} of task {task_id} (instance {instance_id}) at offset {}",
        request.channel,
        request.offset
    );
    // Only the current instance of a task that did not end may still produce output
    let may_produce_output =
        !is_terminal && (request.instance_id.is_none() || request.instance_id == current_instance);
    if may_produce_output {
        streams.attach_pending(key, request.offset)
    } else {
        streams.attach(key, request.offset)
    }
}

/// Sends the retained output and then live output until the stream ends
/// or the client disconnects.
async fn stream_output<
    Tx: Sink<ToClientMessage, Error = TaskhiveError> + Unpin + 'static,
    Rx: Stream<Item = crate::Result<FromClientMessage>> + Unpin,
>(
    tx: &mut Tx,
    rx: &mut Rx,
    attached: AttachedStream,
) {
    let AttachedStream { backlog, receiver } = attached;
    for event in backlog {
        if tx.send(ToClientMessage::StreamEvent(event)).await.is_err() {
            return;
        }
    }
    let Some(mut receiver) = receiver else {
        return;
    };
    loop {
        let event = tokio::select! {
            event = receiver.recv() => event,
            _ = rx.next() => {
                log::debug!("Output streaming terminated by client");
                return;
            }
        };
        let Some(event) = event else {
            break;
        };
        let eof = matches!(event, StreamEvent::Eof { .. });
        if tx.send(ToClientMessage::StreamEvent(event)).await.is_err() || eof {
            return;
        }
    }
    log::debug!("Output streaming completed");
}

fn handle_worker_list(state_ref: &StateRef, senders: &Senders) -> ToClientMessage {
    let mut worker_ids: Vec<WorkerId> = state_ref.get().get_workers().keys().copied().collect();
    worker_ids.sort_unstable();
    let runtimes: Vec<_> = worker_ids
        .iter()
        .map(|id| senders.server_ref.worker_info(*id).map(|info| info.runtime))
        .collect();

    let state = state_ref.get();
    let workers = worker_ids
        .into_iter()
        .zip(runtimes)
        .filter_map(|(id, runtime)| state.get_worker(id).map(|w| w.make_info(runtime)))
        .collect();
    ToClientMessage::WorkerListResponse(WorkerListResponse { workers })
}

fn handle_worker_stop(
    state_ref: &StateRef,
    senders: &Senders,
    selector: &IdSelector,
) -> ToClientMessage {
    log::debug!("Client asked for worker termination {selector:?}");
    let worker_ids: Vec<WorkerId> = {
        let state = state_ref.get();
        match selector {
            IdSelector::Specific(array) => array.iter().map(|id| id.into()).collect(),
            IdSelector::All => {
                let mut ids: Vec<_> = state
                    .get_workers()
                    .values()
                    .filter(|worker| worker.is_online())
                    .map(|worker| worker.worker_id())
                    .collect();
                ids.sort_unstable();
                ids
            }
            IdSelector::LastN(n) => {
                let mut ids: Vec<_> = state.get_workers().keys().copied().collect();
                ids.sort_by_key(|&k| std::cmp::Reverse(k));
                ids.truncate(*n as usize);
                ids
            }
        }
    };

    let mut responses: Vec<(WorkerId, StopWorkerResponse)> = Vec::new();
    for worker_id in worker_ids {
        let online = state_ref.get().get_worker(worker_id).map(|w| w.is_online());
        let response = match online {
            None => StopWorkerResponse::InvalidWorker,
            Some(false) => StopWorkerResponse::AlreadyStopped,
            Some(true) => match senders.server_ref.stop_worker(worker_id) {
                Ok(()) => StopWorkerResponse::Stopped,
                Err(error) => {
                    log::error!("Unable to stop worker {worker_id}: {error}");
                    StopWorkerResponse::Failed(error.to_string())
                }
            },
        };
        responses.push((worker_id, response));
    }
    ToClientMessage::StopWorkerResponse(responses)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hive::program::StdioDef;
    use hive::worker::STDOUT_CHANNEL;

    use crate::common::arraydef::IntArray;
    use crate::tests::server::{RunningServer, run_server_test};
    use crate::tests::utils::{program, task_desc, task_with_deps};
    use crate::transfer::messages::{
        CancelJobResponse, CancelRequest, CloseJobRequest, CloseJobResponse, ForgetJobRequest,
        ForgetJobResponse, FromClientMessage, IdSelector, JobDescription, JobInfoRequest,
        JobListRequest, JobSpec, JobStatus, OpenJobRequest, StreamAttachRequest, StreamEvent,
        SubmitRequest, TaskListRequest, TaskStatus, ToClientMessage, WaitForJobsRequest,
        WaitForJobsResponse,
    };
    use crate::{InstanceId, JobId, JobTaskId};

    fn array_job(n_tasks: u32) -> JobDescription {
        JobDescription::Array {
            ids: IntArray::from_range(0, n_tasks),
            entries: None,
            task_desc: task_desc(),
        }
    }

    async fn submit(
        server: &RunningServer,
        job_desc: JobDescription,
        job_id: Option<JobId>,
    ) -> JobId {
        let request = SubmitRequest {
            spec: JobSpec::default(),
            job_desc,
            job_id,
        };
        match server.request(FromClientMessage::Submit(request)).await {
            ToClientMessage::SubmitResponse(response) => response.job_id,
            message => panic!("Unexpected response {message:?}"),
        }
    }

    async fn job_status(server: &RunningServer, job_id: JobId) -> JobStatus {
        let request = JobInfoRequest {
            selector: IdSelector::Specific(IntArray::from_id(job_id.as_num())),
        };
        match server.request(FromClientMessage::JobInfo(request)).await {
            ToClientMessage::JobInfoResponse(response) => response.jobs[0].status,
            message => panic!("Unexpected response {message:?}"),
        }
    }

    async fn wait_for_all(server: &RunningServer) -> WaitForJobsResponse {
        let request = WaitForJobsRequest {
            selector: IdSelector::All,
        };
        let response = tokio::time::timeout(
            Duration::from_secs(10),
            server.request(FromClientMessage::WaitForJobs(request)),
        )
        .await
        .expect("Jobs have not finished");
        match response {
            ToClientMessage::WaitForJobsResponse(response) => response,
            message => panic!("Unexpected response {message:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_and_list() {
        run_server_test(Default::default(), |server| async move {
            let job_id = submit(&server, array_job(3), None).await;
            assert_eq!(job_id, JobId::new(1));

            let response = server
                .request(FromClientMessage::JobList(JobListRequest::default()))
                .await;
            let ToClientMessage::JobListResponse(response) = response else {
                panic!("Unexpected response");
            };
            assert_eq!(response.jobs.len(), 1);
            assert_eq!(response.jobs[0].n_tasks, 3);
            assert_eq!(response.jobs[0].status, JobStatus::Submitted);

            let response = server
                .request(FromClientMessage::JobList(JobListRequest {
                    status: vec![JobStatus::Finished],
                    ..Default::default()
                }))
                .await;
            let ToClientMessage::JobListResponse(response) = response else {
                panic!("Unexpected response");
            };
            assert!(response.jobs.is_empty());

            let response = server
                .request(FromClientMessage::TaskList(TaskListRequest {
                    job_id,
                    status: vec![],
                }))
                .await;
            let ToClientMessage::TaskListResponse(response) = response else {
                panic!("Unexpected response");
            };
            assert_eq!(response.tasks.len(), 3);
            assert!(
                response
                    .tasks
                    .iter()
                    .all(|task| task.status == TaskStatus::Ready)
            );
        })
        .await;
    }

    #[tokio::test]
    async fn test_invalid_submit_is_rejected() {
        run_server_test(Default::default(), |server| async move {
            let request = SubmitRequest {
                spec: JobSpec::default(),
                job_desc: JobDescription::Graph {
                    tasks: vec![task_with_deps(0, &[1]), task_with_deps(1, &[0])],
                },
                job_id: None,
            };
            let response = server.request(FromClientMessage::Submit(request)).await;
            assert!(matches!(response, ToClientMessage::Error(_)));

            // The rejected submission did not consume a job id
            let job_id = submit(&server, array_job(1), None).await;
            assert_eq!(job_id, JobId::new(1));
        })
        .await;
    }

    #[tokio::test]
    async fn test_cancel_and_forget_waiting_job() {
        run_server_test(Default::default(), |server| async move {
            let job_id = submit(&server, array_job(2), None).await;

            let response = server
                .request(FromClientMessage::Cancel(CancelRequest {
                    selector: IdSelector::All,
                }))
                .await;
            let ToClientMessage::CancelJobResponse(responses) = response else {
                panic!("Unexpected response");
            };
            assert_eq!(
                responses,
                vec![(
                    job_id,
                    CancelJobResponse::Canceled(vec![JobTaskId::new(0), JobTaskId::new(1)], 0)
                )]
            );
            assert_eq!(job_status(&server, job_id).await, JobStatus::Canceled);
            assert_eq!(wait_for_all(&server).await.canceled, 1);

            let response = server
                .request(FromClientMessage::ForgetJob(ForgetJobRequest {
                    selector: IdSelector::All,
                }))
                .await;
            let ToClientMessage::ForgetJobResponse(response) = response else {
                panic!("Unexpected response");
            };
            assert_eq!(
                response,
                ForgetJobResponse {
                    forgotten: 1,
                    ignored: 0
                }
            );
            assert!(server.state_ref.get().get_job(job_id).is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_open_job() {
        run_server_test(Default::default(), |server| async move {
            let response = server
                .request(FromClientMessage::OpenJob(OpenJobRequest {
                    spec: JobSpec::default(),
                }))
                .await;
            let ToClientMessage::OpenJobResponse(job_id) = response else {
                panic!("Unexpected response");
            };
            submit(&server, array_job(1), Some(job_id)).await;
            submit(
                &server,
                JobDescription::Graph {
                    tasks: vec![task_with_deps(5, &[0])],
                },
                Some(job_id),
            )
            .await;
            assert_eq!(
                server.state_ref.get().get_job(job_id).unwrap().n_tasks(),
                2
            );

            let close = || {
                server.request(FromClientMessage::CloseJob(CloseJobRequest {
                    selector: IdSelector::Specific(IntArray::from_id(job_id.as_num())),
                }))
            };
            let ToClientMessage::CloseJobResponse(response) = close().await else {
                panic!("Unexpected response");
            };
            assert_eq!(response, vec![(job_id, CloseJobResponse::Closed)]);
            let ToClientMessage::CloseJobResponse(response) = close().await else {
                panic!("Unexpected response");
            };
            assert_eq!(response, vec![(job_id, CloseJobResponse::AlreadyClosed)]);

            // A closed job does not accept tasks anymore
            let request = SubmitRequest {
                spec: JobSpec::default(),
                job_desc: JobDescription::Graph {
                    tasks: vec![task_with_deps(7, &[])],
                },
                job_id: Some(job_id),
            };
            let response = server.request(FromClientMessage::Submit(request)).await;
            assert!(matches!(response, ToClientMessage::Error(_)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_canceled_open_job_rejects_submissions() {
        run_server_test(Default::default(), |server| async move {
            let response = server
                .request(FromClientMessage::OpenJob(OpenJobRequest {
                    spec: JobSpec::default(),
                }))
                .await;
            let ToClientMessage::OpenJobResponse(job_id) = response else {
                panic!("Unexpected response");
            };
            submit(
                &server,
                JobDescription::Graph {
                    tasks: vec![task_with_deps(0, &[]), task_with_deps(1, &[0])],
                },
                Some(job_id),
            )
            .await;
            let statuses: Vec<TaskStatus> = server
                .state_ref
                .get()
                .get_job(job_id)
                .unwrap()
                .make_task_list(&[])
                .iter()
                .map(|task| task.status)
                .collect();
            assert_eq!(statuses, vec![TaskStatus::Ready, TaskStatus::Waiting]);

            let response = server
                .request(FromClientMessage::Cancel(CancelRequest {
                    selector: IdSelector::Specific(IntArray::from_id(job_id.as_num())),
                }))
                .await;
            assert!(matches!(response, ToClientMessage::CancelJobResponse(_)));
            assert!(!server.state_ref.get().get_job(job_id).unwrap().is_open);
            assert_eq!(job_status(&server, job_id).await, JobStatus::Canceled);
            assert_eq!(wait_for_all(&server).await.canceled, 1);

            let request = SubmitRequest {
                spec: JobSpec::default(),
                job_desc: JobDescription::Graph {
                    tasks: vec![task_with_deps(2, &[])],
                },
                job_id: Some(job_id),
            };
            let response = server.request(FromClientMessage::Submit(request)).await;
            assert!(matches!(response, ToClientMessage::Error(_)));
            assert_eq!(
                server.state_ref.get().get_job(job_id).unwrap().n_tasks(),
                2
            );
        })
        .await;
    }

    #[tokio::test]
    async fn test_running_job_is_not_forgotten() {
        run_server_test(Default::default(), |server| async move {
            submit(&server, array_job(1), None).await;
            let response = server
                .request(FromClientMessage::ForgetJob(ForgetJobRequest {
                    selector: IdSelector::LastN(1),
                }))
                .await;
            let ToClientMessage::ForgetJobResponse(response) = response else {
                panic!("Unexpected response");
            };
            assert_eq!(response.ignored, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_attach_to_unknown_task() {
        run_server_test(Default::default(), |server| async move {
            let request = StreamAttachRequest {
                job_id: JobId::new(3),
                task_id: JobTaskId::new(0),
                instance_id: None,
                channel: STDOUT_CHANNEL,
                offset: 0,
            };
            let response = server
                .request(FromClientMessage::StreamAttach(request))
                .await;
            assert!(matches!(response, ToClientMessage::Error(_)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_attach_to_unknown_instance_is_rejected() {
        run_server_test(Default::default(), |server| async move {
            let job_id = submit(&server, array_job(1), None).await;
            let attach = |instance_id: Option<u32>| StreamAttachRequest {
                job_id,
                task_id: JobTaskId::new(0),
                instance_id: instance_id.map(InstanceId::new),
                channel: STDOUT_CHANNEL,
                offset: 0,
            };
            let response = server
                .request(FromClientMessage::StreamAttach(attach(Some(41))))
                .await;
            assert!(matches!(response, ToClientMessage::Error(_)));
            let response = server
                .request(FromClientMessage::StreamAttach(attach(Some(42))))
                .await;
            assert!(matches!(response, ToClientMessage::Error(_)));
            assert_eq!(server.senders.streams.get().stream_count(), 0);

            // The task did not run yet, its output may still appear
            let mut session = server.client().await;
            session
                .connection()
                .send(FromClientMessage::StreamAttach(attach(None)))
                .await
                .unwrap();
            tokio::time::timeout(Duration::from_secs(5), async {
                while server.senders.streams.get().stream_count() == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
            assert_eq!(server.senders.streams.get().stream_count(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_job_runs_on_worker() {
        run_server_test(Default::default(), |server| async move {
            server.start_worker(2).await;

            let mut desc = task_desc();
            desc.program = program(&["sh", "-c", "echo hello-$HIVE_TASK_ID"]);
            desc.program.stdout = StdioDef::Stream;
            let job_id = submit(
                &server,
                JobDescription::Array {
                    ids: IntArray::from_id(4),
                    entries: None,
                    task_desc: desc,
                },
                None,
            )
            .await;

            let response = wait_for_all(&server).await;
            assert_eq!(response.finished, 1);
            assert_eq!(job_status(&server, job_id).await, JobStatus::Finished);

            let mut session = server.client().await;
            let connection = session.connection();
            connection
                .send(FromClientMessage::StreamAttach(StreamAttachRequest {
                    job_id,
                    task_id: JobTaskId::new(4),
                    instance_id: None,
                    channel: STDOUT_CHANNEL,
                    offset: 0,
                }))
                .await
                .unwrap();
            let mut output = Vec::new();
            loop {
                match connection.receive().await.unwrap().unwrap() {
                    ToClientMessage::StreamEvent(StreamEvent::Data { data, .. }) => {
                        output.extend(data)
                    }
                    ToClientMessage::StreamEvent(StreamEvent::Eof { offset }) => {
                        assert_eq!(offset, output.len() as u64);
                        break;
                    }
                    message => panic!("Unexpected message {message:?}"),
                }
            }
            assert_eq!(output, b"hello-4\n");
        })
        .await;
    }

    #[tokio::test]
    async fn test_failed_task_fails_job() {
        run_server_test(Default::default(), |server| async move {
            server.start_worker(1).await;
            let mut desc = task_desc();
            desc.program = program(&["sh", "-c", "exit 3"]);
            desc.retry.max_retries = 0;
            let job_id = submit(
                &server,
                JobDescription::Array {
                    ids: IntArray::from_id(0),
                    entries: None,
                    task_desc: desc,
                },
                None,
            )
            .await;
            assert_eq!(wait_for_all(&server).await.failed, 1);

            let response = server
                .request(FromClientMessage::TaskList(TaskListRequest {
                    job_id,
                    status: vec![TaskStatus::Failed],
                }))
                .await;
            let ToClientMessage::TaskListResponse(response) = response else {
                panic!("Unexpected response");
            };
            let error = response.tasks[0].error.clone().unwrap();
            assert!(error.contains("exit code 3"));
        })
        .await;
    }
}
