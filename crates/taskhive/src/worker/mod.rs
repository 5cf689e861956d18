//! Worker side of taskhive: executes task bodies received from the server as processes.

use std::time::Duration;

use tokio::sync::oneshot::Receiver;

use hive::launcher::{StopReason, TaskBuildContext, TaskFuture, TaskLauncher};

use crate::transfer::messages::TaskBody;
use crate::worker::program::build_program_task;

pub mod bootstrap;
mod parser;
mod program;

/// Time between SIGTERM and SIGKILL when a running task is stopped
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

pub struct TaskhiveLauncher {
    kill_grace: Duration,
}

impl TaskhiveLauncher {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl TaskLauncher for TaskhiveLauncher {
    fn build_task(
        &self,
        ctx: TaskBuildContext,
        stop_receiver: Receiver<StopReason>,
    ) -> hive::Result<TaskFuture> {
        log::debug!(
            "Starting task {} instance={} alloc={:?} body_len={}",
            ctx.task_id(),
            ctx.instance_id(),
            ctx.allocation(),
            ctx.body().len(),
        );
        let body: TaskBody = hive::comm::deserialize(ctx.body())?;
        build_program_task(ctx, stop_receiver, body, self.kill_grace)
    }
}
