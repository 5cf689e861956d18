use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use orion::aead::SecretKey;
use tokio::net::lookup_host;
use tokio::task::LocalSet;

use hive::resources::{CPU_RESOURCE_NAME, ResourceDescriptor, ResourceDescriptorItem};
use hive::worker::{ServerLostPolicy, WorkerConfiguration, run_worker};

use crate::common::access::{AccessRecord, parse_secret_key};
use crate::common::timeutils::parse_duration;
use crate::server::config::DEFAULT_ACCESS_FILE;
use crate::worker::parser::{parse_cpu_definition, parse_resource_definition};
use crate::worker::{DEFAULT_KILL_GRACE, TaskhiveLauncher};
use crate::{DEFAULT_WORKER_GROUP_NAME, Map};

pub const WORKER_EXTRA_PROCESS_PID: &str = "ProcessPid";

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ArgServerLostPolicy {
    Stop,
    FinishRunning,
}

impl From<ArgServerLostPolicy> for ServerLostPolicy {
    fn from(policy: ArgServerLostPolicy) -> Self {
        match policy {
            ArgServerLostPolicy::Stop => ServerLostPolicy::Stop,
            ArgServerLostPolicy::FinishRunning => ServerLostPolicy::FinishRunning,
        }
    }
}

#[derive(Parser, Debug)]
pub struct WorkerStartOpts {
    /// Address of the server (`host:port` of its worker port)
    ///
    /// When missing, the address is read from the access file.
    #[arg(long)]
    pub server: Option<String>,

    /// Access file written by the server
    #[arg(long, default_value = DEFAULT_ACCESS_FILE)]
    pub access_file: PathBuf,

    /// Hex encoded secret key, used together with `--server`
    #[arg(long, env = "TASKHIVE_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Number of CPUs (`8`) or sockets times CPUs per socket (`2x4`)
    ///
    /// All CPUs of the machine are used by default.
    #[arg(long)]
    pub cpus: Option<String>,

    /// Additional resource, e.g. `gpus=[0,1]`, `fpga=range(0-3)` or `mem=sum(4096)`
    #[arg(long = "resource", value_parser = parse_resource_definition)]
    pub resources: Vec<ResourceDescriptorItem>,

    /// Multi-node tasks are placed only on workers of the same group
    #[arg(long, default_value = DEFAULT_WORKER_GROUP_NAME)]
    pub group: String,

    /// Overwrites the worker hostname
    #[arg(long)]
    pub hostname: Option<String>,

    /// Directory for the scratch directories of tasks; a temporary directory when missing
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// How often heartbeats are sent to the server
    #[arg(long, default_value = "8s", value_parser = parse_duration)]
    pub heartbeat: Duration,

    /// The worker stops when it has no task for the given time
    #[arg(long, value_parser = parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// The worker stops after the given time
    #[arg(long, value_parser = parse_duration)]
    pub time_limit: Option<Duration>,

    /// What happens with running tasks when the connection to the server is lost
    #[arg(long, default_value_t = ArgServerLostPolicy::Stop, value_enum)]
    pub on_server_lost: ArgServerLostPolicy,

    /// Time between SIGTERM and SIGKILL when a task is stopped
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub kill_grace: Duration,
}

fn parse_cpus(value: Option<&str>) -> anyhow::Result<ResourceDescriptor> {
    match value {
        Some(value) => parse_cpu_definition(value),
        None => {
            let n_cpus = std::thread::available_parallelism()
                .context("Cannot detect the number of CPUs, use --cpus")?;
            let n_cpus = u32::try_from(n_cpus.get()).context("Too many CPUs")?;
            Ok(ResourceDescriptor::simple_cpus(n_cpus))
        }
    }
}

pub fn gather_configuration(opts: &WorkerStartOpts) -> anyhow::Result<WorkerConfiguration> {
    log::debug!("Gathering worker configuration information");
    let mut resources = parse_cpus(opts.cpus.as_deref())?;
    for item in &opts.resources {
        if item.name == CPU_RESOURCE_NAME {
            bail!("CPUs have to be defined with --cpus");
        }
        resources = resources.with_item(item.clone());
    }
    resources.validate()?;

    let hostname = opts
        .hostname
        .clone()
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
    let work_dir = opts.work_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("taskhive-worker-{}", std::process::id()))
    });

    let mut extra = Map::default();
    extra.insert(
        WORKER_EXTRA_PROCESS_PID.to_string(),
        std::process::id().to_string(),
    );

    Ok(WorkerConfiguration {
        resources,
        listen_address: Default::default(),
        hostname,
        group: opts.group.clone(),
        work_dir,
        heartbeat_interval: opts.heartbeat,
        idle_timeout: opts.idle_timeout,
        time_limit: opts.time_limit,
        on_server_lost: opts.on_server_lost.into(),
        max_output_chunk: 0,
        extra,
    })
}

fn resolve_server(opts: &WorkerStartOpts) -> anyhow::Result<(String, Option<Arc<SecretKey>>)> {
    match &opts.server {
        Some(address) => {
            let key = opts.secret_key.as_deref().map(parse_secret_key).transpose()?;
            Ok((address.clone(), key))
        }
        None => {
            let record = AccessRecord::read(&opts.access_file)?;
            let key = match opts.secret_key.as_deref() {
                Some(key) => Some(parse_secret_key(key)?),
                None => record.secret_key()?,
            };
            Ok((record.worker_address(), key))
        }
    }
}

/// Connects to the server and runs the worker until it stops or receives SIGINT.
pub async fn start_worker(opts: WorkerStartOpts) -> anyhow::Result<()> {
    log::info!("Starting taskhive worker {}", crate::TASKHIVE_VERSION);
    let configuration = gather_configuration(&opts)?;
    let (server_address, secret_key) = resolve_server(&opts)?;
    log::info!("Connecting to: {server_address}");

    let server_addresses = lookup_host(&server_address)
        .await
        .with_context(|| format!("Cannot resolve server address `{server_address}`"))?
        .collect::<Vec<_>>();
    log::debug!("Resolved server to addresses {server_addresses:?}");

    let launcher = Box::new(TaskhiveLauncher::new(opts.kill_grace));
    // Task processes are driven by local tasks of the worker
    LocalSet::new()
        .run_until(async move {
            let ((worker_id, configuration), worker_future) =
                run_worker(&server_addresses, configuration, secret_key, launcher).await?;
            log::info!(
                "Worker {worker_id} registered with resources {:?}, working directory {}",
                configuration.resources,
                configuration.work_dir.display()
            );

            tokio::select! {
                r = worker_future => r?,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received SIGINT, stopping worker");
                }
            }
            log::info!("Worker {worker_id} stopping");
            anyhow::Ok(())
        })
        .await
}

impl Default for WorkerStartOpts {
    fn default() -> Self {
        WorkerStartOpts {
            server: None,
            access_file: PathBuf::from(DEFAULT_ACCESS_FILE),
            secret_key: None,
            cpus: None,
            resources: Vec::new(),
            group: DEFAULT_WORKER_GROUP_NAME.to_string(),
            hostname: None,
            work_dir: None,
            heartbeat: Duration::from_secs(8),
            idle_timeout: None,
            time_limit: None,
            on_server_lost: ArgServerLostPolicy::Stop,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}
