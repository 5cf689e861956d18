use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::Either;
use futures::{SinkExt, Stream, StreamExt};
use orion::aead::SecretKey;
use orion::aead::streaming::StreamOpener;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::WorkerId;
use crate::internal::common::error::DsError;
use crate::internal::common::resources::ResourceIdMap;
use crate::internal::messages::worker::{
    FromWorkerMessage, RegisterWorker, ToWorkerMessage, WorkerRegistrationResponse,
    WorkerStopReason,
};
use crate::internal::server::rpc::ConnectionDescriptor;
use crate::internal::transfer::auth::{
    SERVER_ROLE, WORKER_ROLE, do_authentication, forward_queue_to_sealed_sink, open_message,
    seal_message, serialize,
};
use crate::internal::transfer::transport::make_protocol_builder;
use crate::internal::worker::comm::WorkerComm;
use crate::internal::worker::configuration::{
    ServerLostPolicy, WorkerConfiguration, sync_worker_configuration,
};
use crate::internal::worker::reactor::process_worker_message;
use crate::internal::worker::state::WorkerStateRef;
use crate::launcher::TaskLauncher;

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);

async fn connect_to_server(addresses: &[SocketAddr]) -> crate::Result<(TcpStream, SocketAddr)> {
    log::info!("Connecting to server (candidate addresses = {addresses:?})");

    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(addresses).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                let address = stream.peer_addr()?;
                log::debug!("Connected to server at {address:?}");
                return Ok((stream, address));
            }
            Err(e) => {
                log::error!(
                    "Could not connect to server (attempt {attempt}/{CONNECT_ATTEMPTS}): {e}"
                );
                sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
    Err(DsError::GenericError(
        "Server could not be connected".into(),
    ))
}

pub async fn connect_to_server_and_authenticate(
    server_addresses: &[SocketAddr],
    secret_key: &Option<Arc<SecretKey>>,
) -> crate::Result<ConnectionDescriptor> {
    let (stream, address) = connect_to_server(server_addresses).await?;
    let (mut writer, mut reader) = make_protocol_builder().new_framed(stream).split();
    let (sealer, opener) = do_authentication(
        crate::PROTOCOL_VERSION,
        WORKER_ROLE,
        SERVER_ROLE,
        secret_key.clone(),
        &mut writer,
        &mut reader,
    )
    .await?;
    Ok(ConnectionDescriptor {
        address,
        receiver: reader,
        sender: writer,
        sealer,
        opener,
    })
}

/// Connects the worker to the server and registers it.
///
/// Returns the assigned id with the synchronized configuration, and the future
/// that runs the worker until it is stopped or it loses the server.
pub async fn run_worker(
    server_addresses: &[SocketAddr],
    mut configuration: WorkerConfiguration,
    secret_key: Option<Arc<SecretKey>>,
    launcher: Box<dyn TaskLauncher>,
) -> crate::Result<(
    (WorkerId, WorkerConfiguration),
    impl Future<Output = crate::Result<()>> + use<>,
)> {
    configuration.resources.validate()?;
    std::fs::create_dir_all(&configuration.work_dir).map_err(|e| {
        DsError::GenericError(format!(
            "Cannot create work directory {}: {e}",
            configuration.work_dir.display()
        ))
    })?;

    let ConnectionDescriptor {
        mut sender,
        mut receiver,
        mut opener,
        mut sealer,
        address,
    } = connect_to_server_and_authenticate(server_addresses, &secret_key).await?;
    {
        let message = RegisterWorker {
            configuration: configuration.clone(),
        };
        let data = serialize(&message)?.into();
        sender.send(seal_message(&mut sealer, data)?).await?;
    }

    let data = timeout(REGISTRATION_TIMEOUT, receiver.next())
        .await
        .map_err(|_| "Did not receive worker registration response")?
        .ok_or_else(|| DsError::from("Connection closed without registration response"))??;
    let WorkerRegistrationResponse {
        worker_id,
        resource_names,
        server_idle_timeout,
        server_uid,
    } = open_message(&mut opener, &data)?;
    log::info!("Worker {worker_id} registered at server {address}");

    sync_worker_configuration(&mut configuration, server_idle_timeout);

    let (queue_sender, queue_receiver) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
    let state = WorkerStateRef::new(
        WorkerComm::new(queue_sender),
        worker_id,
        configuration.clone(),
        ResourceIdMap::from_vec(resource_names),
        launcher,
        server_uid,
    );

    let heartbeat_fut = heartbeat_process(configuration.heartbeat_interval, state.clone());
    let idle_timeout_fut = match configuration.idle_timeout {
        Some(timeout) => Either::Left(idle_timeout_process(timeout, state.clone())),
        None => Either::Right(futures::future::pending()),
    };
    let time_limit_fut = match configuration.time_limit {
        None => Either::Left(futures::future::pending::<()>()),
        Some(d) => Either::Right(sleep(d)),
    };

    let future = async move {
        let send_loop = forward_queue_to_sealed_sink(queue_receiver, sender, sealer);
        tokio::pin!(send_loop);

        let result: crate::Result<Option<WorkerStopReason>> = tokio::select! {
            r = worker_message_loop(state.clone(), receiver, opener) => {
                log::debug!("Server read connection has disconnected");
                r.map(|_| None)
            }
            r = &mut send_loop => {
                log::debug!("Server write connection has disconnected");
                r.and_then(|_| Err("Server write connection closed".into()))
            }
            _ = time_limit_fut => {
                log::info!("Time limit reached");
                Ok(Some(WorkerStopReason::TimeLimitReached))
            }
            _ = idle_timeout_fut => {
                log::info!("Idle timeout reached");
                Ok(Some(WorkerStopReason::IdleTimeout))
            }
            _ = heartbeat_fut => { unreachable!() }
        };

        match result {
            Ok(Some(reason)) => {
                // The worker ends on its own, the server is told why
                {
                    let mut state = state.get_mut();
                    state.cancel_all_tasks();
                    let mut comm = state.comm();
                    comm.send_message_to_server(FromWorkerMessage::Stop(reason));
                    comm.drop_sender();
                }
                send_loop.await?;
                Ok(())
            }
            Ok(None) => {
                // Stopped by the server
                state.get_mut().cancel_all_tasks();
                Ok(())
            }
            Err(e) => {
                log::error!("Connection to the server was lost: {e}");
                finish_tasks_on_server_lost(state).await;
                Err(e)
            }
        }
    };
    Ok(((worker_id, configuration), future))
}

async fn finish_tasks_on_server_lost(state: WorkerStateRef) {
    let on_server_lost = state.get().configuration.on_server_lost;
    match on_server_lost {
        ServerLostPolicy::Stop => {
            state.get_mut().cancel_all_tasks();
        }
        ServerLostPolicy::FinishRunning => {
            let notify = {
                let mut state = state.get_mut();
                state.drop_non_running_tasks();
                state.comm().drop_sender();
                if state.has_tasks() {
                    let notify = Rc::new(Notify::new());
                    state.comm().set_idle_worker_notify(notify.clone());
                    Some(notify)
                } else {
                    None
                }
            };
            if let Some(notify) = notify {
                log::info!("Waiting for running tasks to finish");
                notify.notified().await;
                log::info!("All running tasks were finished");
            } else {
                log::info!("No running tasks remain");
            }
        }
    }
}

/// Repeatedly sends a heartbeat message to the server.
async fn heartbeat_process(heartbeat_interval: Duration, state_ref: WorkerStateRef) {
    let mut interval = tokio::time::interval(heartbeat_interval);
    loop {
        interval.tick().await;
        state_ref
            .get()
            .comm()
            .send_message_to_server(FromWorkerMessage::Heartbeat);
        log::trace!("Heartbeat sent");
    }
}

/// Resolves when the worker had nothing to do for `idle_timeout`.
async fn idle_timeout_process(idle_timeout: Duration, state_ref: WorkerStateRef) {
    let period = Duration::from_secs(1)
        .min(idle_timeout)
        .max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let state = state_ref.get();
        if state.is_idle() && state.last_task_finish_time.elapsed() > idle_timeout {
            break;
        }
    }
}

/// Runs until the server closes the connection or asks the worker to stop.
async fn worker_message_loop(
    state_ref: WorkerStateRef,
    mut stream: impl Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
    mut opener: Option<StreamOpener>,
) -> crate::Result<()> {
    while let Some(data) = stream.next().await {
        let data = data?;
        let message: ToWorkerMessage = open_message(&mut opener, &data)?;
        let mut state = state_ref.get_mut();
        if process_worker_message(&mut state, &state_ref, message) {
            return Ok(());
        }
    }
    log::debug!("Connection to server is closed");
    Err("Server connection closed".into())
}
