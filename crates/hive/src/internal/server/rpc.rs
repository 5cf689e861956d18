use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{Stream, StreamExt};
use orion::aead::streaming::{StreamOpener, StreamSealer};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::WorkerId;
use crate::gateway::LostWorkerReason;
use crate::internal::common::error::DsError;
use crate::internal::common::taskgroup::TaskGroup;
use crate::internal::messages::worker::{
    FromWorkerMessage, RegisterWorker, WorkerRegistrationResponse, WorkerStopReason,
};
use crate::internal::server::comm::CommSenderRef;
use crate::internal::server::core::CoreRef;
use crate::internal::server::reactor::{
    on_new_worker, on_peer_ready, on_remove_worker, on_task_canceled, on_task_error,
    on_task_finished, on_task_output, on_task_running, on_worker_heartbeat,
};
use crate::internal::server::worker::Worker;
use crate::internal::transfer::auth::{
    SERVER_ROLE, WORKER_ROLE, do_authentication, forward_queue_to_sealed_sink, open_message,
    serialize,
};
use crate::internal::transfer::transport::make_protocol_builder;
use crate::internal::worker::configuration::sync_worker_configuration;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ConnectionDescriptor {
    pub address: std::net::SocketAddr,
    pub receiver: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
    pub sender: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
    pub sealer: Option<StreamSealer>,
    pub opener: Option<StreamOpener>,
}

pub(crate) async fn connection_initiator(
    listener: TcpListener,
    core_ref: CoreRef,
    comm_ref: CommSenderRef,
) -> crate::Result<()> {
    let group = TaskGroup::default();
    loop {
        let (socket, address) = group.run_until(listener.accept()).await?;
        socket.set_nodelay(true)?;
        let core_ref = core_ref.clone();
        let comm_ref = comm_ref.clone();
        group.add_task(async move {
            log::debug!("New connection: {address}");
            let (connection, message) =
                match worker_authentication(&core_ref, socket, address).await {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("Worker connection from {address} rejected: {e}");
                        return;
                    }
                };
            match worker_rpc_loop(&core_ref, &comm_ref, connection, message).await {
                Ok(_) => log::debug!("Connection ended: {address}"),
                Err(e) => log::warn!("Worker connection ended with: {e:?}"),
            }
        });
    }
}

/// Runs the handshake (protocol version and role check) and waits for the registration message
pub(crate) async fn worker_authentication(
    core_ref: &CoreRef,
    stream: TcpStream,
    address: std::net::SocketAddr,
) -> crate::Result<(ConnectionDescriptor, RegisterWorker)> {
    let (mut writer, mut reader) = make_protocol_builder().new_framed(stream).split();

    let secret_key = core_ref.get().secret_key().cloned();
    let (sealer, mut opener) = do_authentication(
        crate::PROTOCOL_VERSION,
        SERVER_ROLE,
        WORKER_ROLE,
        secret_key,
        &mut writer,
        &mut reader,
    )
    .await?;
    let message_data = timeout(REGISTRATION_TIMEOUT, reader.next())
        .await
        .map_err(|_| "Worker registration did not arrive")?
        .ok_or_else(|| {
            DsError::from("The remote side closed connection without worker registration")
        })??;

    let message: RegisterWorker = open_message(&mut opener, &message_data)?;
    message.configuration.resources.validate()?;

    log::debug!("Worker registration from {address}");

    let connection = ConnectionDescriptor {
        address,
        receiver: reader,
        sender: writer,
        opener,
        sealer,
    };
    Ok((connection, message))
}

async fn worker_rpc_loop(
    core_ref: &CoreRef,
    comm_ref: &CommSenderRef,
    connection: ConnectionDescriptor,
    msg: RegisterWorker,
) -> crate::Result<()> {
    let worker_id = core_ref.get_mut().new_worker_id();
    log::info!(
        "Worker {} registered from {} ({})",
        worker_id,
        connection.address,
        msg.configuration.hostname
    );

    let mut configuration = msg.configuration;
    sync_worker_configuration(&mut configuration, *core_ref.get().idle_timeout());

    let (queue_sender, queue_receiver) = tokio::sync::mpsc::unbounded_channel::<Bytes>();

    {
        let mut core = core_ref.get_mut();
        // Every resource kind of the worker needs an id before the pool is built
        for item in &configuration.resources.resources {
            core.get_or_create_resource_id(&item.name);
        }
        let worker = Worker::new(
            worker_id,
            configuration,
            &core.create_resource_map(),
            Instant::now(),
        );
        on_new_worker(&mut core, &mut *comm_ref.get_mut(), worker);
    }

    let message = {
        let core = core_ref.get();
        WorkerRegistrationResponse {
            worker_id,
            resource_names: core.create_resource_map().into_vec(),
            server_idle_timeout: *core.idle_timeout(),
            server_uid: core.server_uid().to_string(),
        }
    };
    queue_sender
        .send(serialize(&message)?.into())
        .map_err(|_| DsError::from("Worker queue closed before registration"))?;

    comm_ref.get_mut().add_worker(worker_id, queue_sender);
    let snd_loop =
        forward_queue_to_sealed_sink(queue_receiver, connection.sender, connection.sealer);

    let reason = tokio::select! {
        result = worker_receive_loop(core_ref.clone(), comm_ref.clone(), worker_id, connection.receiver, connection.opener) => {
            log::debug!("Receive loop terminated ({result:?}), worker={worker_id}");
            match result {
                Ok(Some(WorkerStopReason::IdleTimeout)) => LostWorkerReason::IdleTimeout,
                Ok(Some(WorkerStopReason::TimeLimitReached)) => LostWorkerReason::TimeLimitReached,
                Ok(Some(WorkerStopReason::Interrupted)) | Ok(None) | Err(_) => LostWorkerReason::ConnectionLost,
            }
        }
        e = snd_loop => {
            log::debug!("Sending loop terminated: {e:?}, worker={worker_id}");
            LostWorkerReason::ConnectionLost
        }
    };

    let mut core = core_ref.get_mut();
    let mut comm = comm_ref.get_mut();
    // The worker may be gone already when the liveness sweep closed the connection
    let reason = core
        .get_worker_by_id(worker_id)
        .and_then(|w| w.stop_reason)
        .unwrap_or(reason);
    log::info!(
        "Worker {} ({}) connection closed: {}",
        worker_id,
        connection.address,
        reason
    );
    comm.remove_worker(worker_id);
    on_remove_worker(&mut core, &mut *comm, worker_id, reason);
    Ok(())
}

pub(crate) async fn worker_receive_loop<
    Reader: Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
>(
    core_ref: CoreRef,
    comm_ref: CommSenderRef,
    worker_id: WorkerId,
    mut receiver: Reader,
    mut opener: Option<StreamOpener>,
) -> crate::Result<Option<WorkerStopReason>> {
    while let Some(message) = receiver.next().await {
        let message: FromWorkerMessage = open_message(&mut opener, &message?)?;
        let mut core = core_ref.get_mut();
        let mut comm = comm_ref.get_mut();
        // Any traffic proves that the worker is alive
        on_worker_heartbeat(&mut core, worker_id, Instant::now());
        match message {
            FromWorkerMessage::TaskRunning(msg) => {
                on_task_running(&mut core, &mut *comm, worker_id, msg);
            }
            FromWorkerMessage::TaskFinished(msg) => {
                on_task_finished(&mut core, &mut *comm, worker_id, msg);
            }
            FromWorkerMessage::TaskFailed(msg) => {
                on_task_error(&mut core, &mut *comm, worker_id, msg);
            }
            FromWorkerMessage::TaskCanceled(msg) => {
                on_task_canceled(&mut core, &mut *comm, worker_id, msg);
            }
            FromWorkerMessage::PeerReady(msg) => {
                on_peer_ready(&mut core, &mut *comm, worker_id, msg);
            }
            FromWorkerMessage::TaskOutput(msg) => {
                on_task_output(&mut core, &mut *comm, worker_id, msg);
            }
            FromWorkerMessage::Heartbeat => {
                log::trace!("Heartbeat received, worker={worker_id}");
            }
            FromWorkerMessage::Stop(reason) => {
                log::debug!("Worker {worker_id} is stopping: {reason:?}");
                return Ok(Some(reason));
            }
        }
    }
    Ok(None)
}
