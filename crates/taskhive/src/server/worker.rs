use chrono::{DateTime, Utc};
use hive::gateway::{LostWorkerReason, WorkerRuntimeInfo};
use hive::worker::WorkerConfiguration;

use crate::WorkerId;
use crate::transfer::messages::{WorkerExitInfo, WorkerInfo};

/// Server-side record of a worker. It is kept after the worker disconnects so that
/// listings can still show when and why it left.
pub struct Worker {
    worker_id: WorkerId,
    connected_at: DateTime<Utc>,
    exit: Option<WorkerExitInfo>,
    pub(crate) configuration: WorkerConfiguration,
}

impl Worker {
    pub fn new(worker_id: WorkerId, configuration: WorkerConfiguration) -> Self {
        Worker {
            worker_id,
            connected_at: Utc::now(),
            exit: None,
            configuration,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn hostname(&self) -> &str {
        &self.configuration.hostname
    }

    pub fn is_online(&self) -> bool {
        self.exit.is_none()
    }

    /// Records the disconnection. The first reason is kept, a repeated loss report is ignored
    /// and false is returned.
    pub fn mark_lost(&mut self, reason: LostWorkerReason) -> bool {
        if let Some(exit) = &self.exit {
            log::debug!(
                "Worker {} already left ({}), ignoring {reason}",
                self.worker_id,
                exit.reason
            );
            return false;
        }
        self.exit = Some(WorkerExitInfo {
            ended_at: Utc::now(),
            reason,
        });
        true
    }

    /// `runtime` is only available while the engine still knows the worker
    pub fn make_info(&self, runtime: Option<WorkerRuntimeInfo>) -> WorkerInfo {
        WorkerInfo {
            id: self.worker_id,
            configuration: self.configuration.clone(),
            started: self.connected_at,
            ended: self.exit.clone(),
            runtime: if self.is_online() { runtime } else { None },
        }
    }
}
