use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::net::TcpListener;
use tokio::sync::{Notify, oneshot};
use tokio::task::LocalSet;

use hive::server::server_start;

use crate::common::access::{AccessRecord, serialize_secret_key};
use crate::server::Senders;
use crate::server::autoalloc::{LoggingHintAdapter, allocation_hint_process};
use crate::server::config::ServerConfig;
use crate::server::engine_events::EngineEventProcessor;
use crate::server::event::journal::{JournalReader, JournalWriter, start_event_streaming};
use crate::server::event::streamer::EventStreamer;
use crate::server::restore::StateRestorer;
use crate::server::state::StateRef;
use crate::stream::StreamHubRef;
use crate::transfer::connection::ClientSession;
use crate::transfer::messages::{FromClientMessage, ToClientMessage};
use crate::{TASKHIVE_VERSION, WorkerId};

pub fn generate_server_uid() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

/// Connects to the server described by the given access file.
pub async fn get_client_session(access_file: &Path) -> anyhow::Result<ClientSession> {
    let record = AccessRecord::read(access_file).with_context(|| {
        format!(
            "No running server found, start one with `taskhive server start` or point to \
            a different access file than {}",
            access_file.display()
        )
    })?;
    let address = record.client_address();
    let session = ClientSession::connect_to_server(&address, record.secret_key()?)
        .await
        .with_context(|| format!("Access file found but server at {address} is unreachable"))?;
    Ok(session)
}

/// Asks the server behind the access file to stop.
pub async fn stop_server(access_file: &Path) -> anyhow::Result<()> {
    let mut session = get_client_session(access_file).await?;
    match session
        .connection()
        .send_and_receive(FromClientMessage::Stop)
        .await
    {
        Ok(ToClientMessage::Error(message)) => Err(anyhow!(message)),
        // The server may close the connection before answering
        Ok(_) | Err(_) => Ok(()),
    }
}

type EventStreamFuture = Pin<Box<dyn Future<Output = ()>>>;

fn prepare_event_management(
    config: &ServerConfig,
    server_uid: &str,
    truncate_journal: Option<u64>,
) -> anyhow::Result<(
    EventStreamer,
    Option<oneshot::Receiver<String>>,
    EventStreamFuture,
)> {
    Ok(if let Some(ref path) = config.journal {
        let writer = JournalWriter::create_or_append(path, truncate_journal).map_err(|error| {
            anyhow!("Cannot open journal at `{}`: {error}", path.display())
        })?;
        let (tx, failure, stream_fut) = start_event_streaming(writer, config.journal_flush_period);
        let streamer = EventStreamer::new(Some(tx));
        streamer.on_server_start(server_uid);
        (streamer, Some(failure), Box::pin(stream_fut))
    } else {
        (
            EventStreamer::new(None),
            None,
            Box::pin(futures::future::ready(())),
        )
    })
}

/// Binds the listeners, starts the engine and writes the access file.
///
/// Has to be called inside a [`LocalSet`]. The returned future drives the server until
/// it is stopped by a signal, by a client or by an engine error.
pub async fn initialize_server(
    config: &ServerConfig,
    server_uid: Option<String>,
    worker_id_initial_value: WorkerId,
    truncate_journal: Option<u64>,
) -> anyhow::Result<(
    impl Future<Output = anyhow::Result<()>> + use<>,
    Arc<Notify>,
    StateRef,
    Senders,
    AccessRecord,
)> {
    let client_listener = TcpListener::bind(SocketAddr::new(
        Ipv4Addr::UNSPECIFIED.into(),
        config.client_port,
    ))
    .await
    .context("Cannot create client socket")?;
    let client_port = client_listener.local_addr()?.port();
    let worker_listener = TcpListener::bind(SocketAddr::new(
        Ipv4Addr::UNSPECIFIED.into(),
        config.worker_port,
    ))
    .await
    .context("Cannot create worker socket")?;

    let server_uid = server_uid.unwrap_or_else(generate_server_uid);
    let secret_key = config.resolve_secret_key()?;
    let state_ref = StateRef::new(server_uid.clone());

    let (events, journal_failure, event_stream_fut) =
        prepare_event_management(config, &server_uid, truncate_journal)?;

    let (server_ref, engine_fut) = server_start(
        worker_listener,
        config.server_options(
            server_uid.clone(),
            secret_key.clone(),
            worker_id_initial_value,
        ),
    )?;
    let senders = Senders {
        server_ref: server_ref.clone(),
        events,
        streams: StreamHubRef::new(config.stream_retention_bytes),
    };
    server_ref.set_client_events(Box::new(EngineEventProcessor::new(
        state_ref.clone(),
        senders.clone(),
    )));

    let record = AccessRecord {
        version: TASKHIVE_VERSION.to_string(),
        server_uid: server_uid.clone(),
        host: config.hostname(),
        worker_port: server_ref.get_worker_listen_port(),
        client_port,
        secret_key: secret_key.as_deref().map(serialize_secret_key),
    };
    record.write(&config.access_file)?;
    log::info!(
        "Server {server_uid} is running, workers connect to {}, clients to {}",
        record.worker_address(),
        record.client_address()
    );

    let end_flag = Arc::new(Notify::new());
    let end_flag_check = end_flag.clone();
    let stop_check = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received SIGINT, attempting to stop");
            }
            _ = end_flag_check.notified() => {
                log::info!("Received Stop command from client");
            }
        };
        log::info!("Stopping server");
    };

    let journal_watch = {
        let state_ref = state_ref.clone();
        let server_ref = server_ref.clone();
        async move {
            if let Some(failure) = journal_failure {
                if let Ok(reason) = failure.await {
                    server_ref.halt_dispatch();
                    state_ref
                        .get_mut()
                        .set_halted(format!("Journal cannot be written: {reason}"));
                }
            }
            futures::future::pending::<()>().await
        }
    };

    let hint_process = allocation_hint_process(
        server_ref,
        config.allocation_hint_interval,
        Box::new(LoggingHintAdapter::default()),
    );

    let access_file = config.access_file.clone();
    let state_ref2 = state_ref.clone();
    let senders2 = senders.clone();
    let end_flag_ret = end_flag.clone();
    let fut = async move {
        let result = tokio::select! {
            _ = stop_check => Ok(()),
            _ = crate::server::client::handle_client_connections(
                client_listener,
                state_ref,
                &senders,
                end_flag,
                secret_key,
            ) => Ok(()),
            _ = hint_process => Ok(()),
            _ = journal_watch => Ok(()),
            r = engine_fut => r.map_err(anyhow::Error::from),
        };

        log::debug!("Shutting down event streaming");
        senders.events.on_server_stop();
        event_stream_fut.await;

        if let Err(error) = std::fs::remove_file(&access_file) {
            log::warn!(
                "Cannot remove access file {}: {error}",
                access_file.display()
            );
        }
        result
    };
    Ok((fut, end_flag_ret, state_ref2, senders2, record))
}

/// Starts the server, restoring its state from the journal when the journal exists.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let mut truncate_journal = None;
    let restorer = match &config.journal {
        Some(path) if path.exists() => {
            log::info!("Restoring server state from journal {}", path.display());
            let mut restorer = StateRestorer::default();
            let position = restorer.load_journal(JournalReader::open(path)?)?;
            if position < std::fs::metadata(path)?.len() {
                log::warn!("Journal ends with incomplete data, it will be truncated");
                truncate_journal = Some(position);
            }
            Some(restorer)
        }
        _ => None,
    };

    let local_set = LocalSet::new();
    local_set
        .run_until(async move {
            let mut restorer = restorer;
            let server_uid = restorer.as_mut().and_then(|r| r.take_server_uid());
            let worker_id_initial_value = restorer
                .as_ref()
                .map(|r| r.worker_id_initial_value())
                .unwrap_or(WorkerId::new(1));
            let (fut, _, state_ref, senders, _) =
                initialize_server(&config, server_uid, worker_id_initial_value, truncate_journal)
                    .await?;
            if let Some(restorer) = restorer {
                let submits = restorer.restore_jobs(&mut state_ref.get_mut())?;
                log::debug!("Restoring {} submission(s) into the engine", submits.len());
                for submit in submits {
                    senders.server_ref.add_new_tasks(submit)?;
                }
            }
            fut.await?;
            anyhow::Ok(())
        })
        .await
}
