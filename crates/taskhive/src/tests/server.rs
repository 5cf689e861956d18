use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::LocalSet;
use tokio::time::timeout;

use hive::worker::run_worker;

use crate::WorkerId;
use crate::common::access::AccessRecord;
use crate::server::Senders;
use crate::server::bootstrap::{get_client_session, initialize_server};
use crate::server::config::ServerConfig;
use crate::server::state::StateRef;
use crate::tests::utils::worker_configuration;
use crate::transfer::connection::ClientSession;
use crate::transfer::messages::{FromClientMessage, ToClientMessage};
use crate::worker::TaskhiveLauncher;

pub struct RunningServer {
    pub config: ServerConfig,
    pub record: AccessRecord,
    pub state_ref: StateRef,
    pub senders: Senders,
    pub dir: PathBuf,
    done: watch::Receiver<bool>,
}

impl RunningServer {
    pub async fn client(&self) -> ClientSession {
        get_client_session(&self.config.access_file)
            .await
            .expect("Cannot connect to server")
    }

    /// Sends a single request over a new connection.
    pub async fn request(&self, message: FromClientMessage) -> ToClientMessage {
        let mut session = self.client().await;
        session
            .connection()
            .send_and_receive(message)
            .await
            .expect("Request failed")
    }

    /// Connects an in-process worker; its tasks run as real processes.
    pub async fn start_worker(&self, cpus: u32) -> WorkerId {
        let mut configuration = worker_configuration(cpus);
        configuration.hostname = "localhost".to_string();
        configuration.work_dir = self.dir.join("worker");
        let address = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.record.worker_port);
        let ((worker_id, _), future) = run_worker(
            &[address],
            configuration,
            self.record.secret_key().unwrap(),
            Box::new(TaskhiveLauncher::new(Duration::from_millis(200))),
        )
        .await
        .expect("Cannot start worker");
        tokio::task::spawn_local(async move {
            if let Err(error) = future.await {
                log::debug!("Test worker ended: {error}");
            }
        });
        worker_id
    }

    /// Waits until the server future ends on its own.
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        timeout(Duration::from_secs(5), done.wait_for(|done| *done))
            .await
            .expect("Server has not stopped")
            .expect("Server state was dropped");
    }
}

/// Starts the whole server in a temporary directory and runs the test against it.
/// The server is stopped once the test future finishes.
pub async fn run_server_test<F, Fut>(mut config: ServerConfig, test_fn: F)
where
    F: FnOnce(RunningServer) -> Fut,
    Fut: Future<Output = ()>,
{
    crate::common::setup::enable_test_logging();
    let tmp_dir = TempDir::with_prefix("taskhive-test").unwrap();
    config.host = Some("localhost".to_string());
    config.access_file = tmp_dir.path().join("access.json");
    if let Some(journal) = config.journal.take() {
        config.journal = Some(tmp_dir.path().join(journal));
    }

    let localset = LocalSet::new();
    let (fut, end_flag, state_ref, senders, record) = localset
        .run_until(initialize_server(&config, None, WorkerId::new(1), None))
        .await
        .unwrap();

    let (done_tx, done) = watch::channel(false);
    let server_fut = localset.spawn_local(async move {
        let result = fut.await;
        let _ = done_tx.send(true);
        result
    });

    let server = RunningServer {
        config,
        record,
        state_ref,
        senders,
        dir: tmp_dir.path().to_path_buf(),
        done,
    };
    localset.run_until(test_fn(server)).await;
    end_flag.notify_one();

    let result = localset
        .run_until(async move {
            match timeout(Duration::from_secs(5), server_fut).await {
                Ok(result) => result.unwrap(),
                Err(_) => panic!("The server has not finished in 5 seconds"),
            }
        })
        .await;
    result.expect("Server failed");
}
