use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use orion::aead::SecretKey;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::events::EventProcessor;
use crate::gateway::{BacklogSummary, TaskSubmit, WorkerInfo};
use crate::internal::scheduler::queue::EqualPriorityPolicy;
use crate::internal::scheduler::state::{run_scheduling_now, scheduler_loop};
use crate::internal::server::client::handle_new_tasks;
use crate::internal::server::comm::CommSenderRef;
use crate::internal::server::core::{CoreRef, LivenessConfig};
use crate::internal::server::liveness::liveness_loop;
use crate::internal::server::reactor::{on_cancel_tasks, on_stop_worker};
use crate::{TaskId, WorkerId};

pub const DEFAULT_LIVENESS_PERIOD: Duration = Duration::from_secs(2);

/// Settings of the engine part of the server
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub secret_key: Option<Arc<SecretKey>>,
    /// Minimal delay between two scheduling passes
    pub scheduler_min_delay: Duration,
    /// Idle timeout for workers that do not set their own
    pub idle_timeout: Option<Duration>,
    pub liveness: LivenessConfig,
    /// How often the liveness sweep runs
    pub liveness_period: Duration,
    pub equal_priority_policy: EqualPriorityPolicy,
    /// Resource kinds that may be requested before any worker declares them
    pub resource_kinds: Vec<String>,
    pub server_uid: String,
    /// First worker id handed out; restored servers continue above the old ids
    pub worker_id_initial_value: WorkerId,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            secret_key: None,
            scheduler_min_delay: Duration::from_millis(20),
            idle_timeout: None,
            liveness: Default::default(),
            liveness_period: DEFAULT_LIVENESS_PERIOD,
            equal_priority_policy: Default::default(),
            resource_kinds: Vec::new(),
            server_uid: String::new(),
            worker_id_initial_value: WorkerId::new(1),
        }
    }
}

/// Handle to a running engine, used by the layer above it.
#[derive(Clone)]
pub struct ServerRef {
    core_ref: CoreRef,
    comm_ref: CommSenderRef,
}

impl ServerRef {
    pub fn get_worker_listen_port(&self) -> u16 {
        self.core_ref.get().get_worker_listen_port()
    }

    pub fn add_new_tasks(&self, task_submit: TaskSubmit) -> crate::Result<()> {
        let mut core = self.core_ref.get_mut();
        let mut comm = self.comm_ref.get_mut();
        handle_new_tasks(&mut core, &mut *comm, task_submit)
    }

    pub fn set_client_events(&self, client_events: Box<dyn EventProcessor>) {
        self.comm_ref.set_client_events(client_events);
    }

    /// Cancels tasks and all their consumers.
    ///
    /// Returns tasks that were removed immediately; tasks that were running are
    /// reported through `EventProcessor::on_tasks_canceled` later.
    pub fn cancel_tasks(&self, tasks: &[TaskId]) -> Vec<TaskId> {
        log::debug!("Client asked for canceling tasks: {tasks:?}");
        let mut core = self.core_ref.get_mut();
        let mut comm = self.comm_ref.get_mut();
        on_cancel_tasks(&mut core, &mut *comm, tasks, Instant::now())
    }

    pub fn stop_worker(&self, worker_id: WorkerId) -> crate::Result<()> {
        let mut core = self.core_ref.get_mut();
        let mut comm = self.comm_ref.get_mut();
        on_stop_worker(&mut core, &mut *comm, worker_id)
    }

    pub fn worker_info(&self, worker_id: WorkerId) -> Option<WorkerInfo> {
        let core = self.core_ref.get();
        core.get_worker_by_id(worker_id)
            .map(|w| w.worker_info(core.task_map()))
    }

    pub fn worker_list(&self) -> Vec<WorkerInfo> {
        let core = self.core_ref.get();
        core.get_worker_map()
            .sorted_ids()
            .into_iter()
            .map(|id| core.get_worker_by_id_or_panic(id).worker_info(core.task_map()))
            .collect()
    }

    /// Backlog shape for allocation hints.
    ///
    /// A pending scheduling pass is run first, so the summary does not count
    /// tasks that would be assigned right away.
    pub fn backlog_summary(&self) -> BacklogSummary {
        let mut core = self.core_ref.get_mut();
        let mut comm = self.comm_ref.get_mut();
        if comm.get_scheduling_flag() {
            run_scheduling_now(&mut core, &mut comm, Instant::now());
        }
        core.backlog_summary()
    }

    /// Stops all further assignments; used when the server cannot persist its state
    pub fn halt_dispatch(&self) {
        self.core_ref.get_mut().halt_dispatch();
    }

    pub fn is_dispatch_halted(&self) -> bool {
        self.core_ref.get().is_dispatch_halted()
    }

    /// Debugging overview of workers and queues
    pub fn dump(&self) -> serde_json::Value {
        self.core_ref.get().dump(Instant::now())
    }
}

/// Creates the engine on top of a bound worker listener.
///
/// The returned future drives the scheduler, the liveness sweep and worker
/// connections; it has to be polled inside a `LocalSet`.
pub fn server_start(
    listener: TcpListener,
    options: ServerOptions,
) -> crate::Result<(ServerRef, impl Future<Output = crate::Result<()>>)> {
    let listener_port = listener.local_addr()?.port();

    let scheduler_wakeup = Rc::new(Notify::new());
    let comm_ref = CommSenderRef::new(scheduler_wakeup.clone());

    let core_ref = CoreRef::new(
        listener_port,
        options.secret_key,
        options.idle_timeout,
        options.liveness,
        options.equal_priority_policy,
        &options.resource_kinds,
        options.server_uid,
        options.worker_id_initial_value,
    );
    let connections = crate::internal::server::rpc::connection_initiator(
        listener,
        core_ref.clone(),
        comm_ref.clone(),
    );

    let scheduler = scheduler_loop(
        core_ref.clone(),
        comm_ref.clone(),
        scheduler_wakeup,
        options.scheduler_min_delay,
    );
    let liveness = liveness_loop(core_ref.clone(), comm_ref.clone(), options.liveness_period);

    let future = async move {
        tokio::select! {
            () = scheduler => {},
            () = liveness => {},
            r = connections => r?,
        };
        log::debug!("Engine loops ended");
        Ok(())
    };

    Ok((ServerRef { core_ref, comm_ref }, future))
}
