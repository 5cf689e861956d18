use std::fs::File;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use bstr::ByteSlice;
use nix::libc;
use tokio::process::Command;

use crate::internal::common::error::DsError::GenericError;
use crate::internal::common::resources::{Allocation, ResourceIdMap};
use crate::internal::messages::worker::{ChannelId, FromWorkerMessage, TaskOutputMsg};
use crate::internal::worker::comm::WorkerCommRef;
use crate::internal::worker::configuration::WorkerConfiguration;
use crate::internal::worker::state::WorkerState;
use crate::internal::worker::task::Task;
use crate::program::{ProgramDefinition, StdioDef};
use crate::{InstanceId, Priority, TaskId, WorkerId};

#[derive(Debug)]
pub enum TaskResult {
    Finished,
    Canceled,
    Timeouted,
}

impl From<StopReason> for TaskResult {
    fn from(r: StopReason) -> Self {
        match r {
            StopReason::Cancel => TaskResult::Canceled,
            StopReason::Timeout => TaskResult::Timeouted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancel,
    Timeout,
}

/// Execution of a task; an error means that the task failed
pub type TaskFuture = Pin<Box<dyn Future<Output = crate::Result<TaskResult>>>>;

/// Data necessary to build a task (create a Future representing that task).
pub struct TaskBuildContext<'a> {
    pub(crate) task: &'a Task,
    pub(crate) state: &'a WorkerState,
}

impl<'a> TaskBuildContext<'a> {
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.task.instance_id
    }

    pub fn user_priority(&self) -> Priority {
        self.task.user_priority
    }

    pub fn allocation(&self) -> &'a Allocation {
        &self.task.allocation
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.task.time_limit
    }

    pub fn body(&self) -> &'a [u8] {
        &self.task.body
    }

    /// Hostnames of all nodes of a multi-node task, this worker first
    pub fn node_list(&self) -> &'a [String] {
        &self.task.node_list
    }

    pub fn worker_id(&self) -> WorkerId {
        self.state.worker_id
    }

    pub fn worker_configuration(&self) -> &WorkerConfiguration {
        &self.state.configuration
    }

    pub fn get_resource_map(&self) -> &ResourceIdMap {
        self.state.get_resource_map()
    }

    pub fn server_uid(&self) -> &str {
        self.state.server_uid()
    }

    /// Sender of the task output to the server
    pub fn output_stream(&self) -> OutputStream {
        OutputStream {
            comm: self.state.comm_ref().clone(),
            task_id: self.task.id,
            instance_id: self.task.instance_id,
            max_chunk: self.state.configuration.max_output_chunk.max(1),
        }
    }
}

/// Sends output of one task instance to the server in bounded chunks.
#[derive(Clone)]
pub struct OutputStream {
    comm: WorkerCommRef,
    task_id: TaskId,
    instance_id: InstanceId,
    max_chunk: usize,
}

impl OutputStream {
    pub fn send_data(&self, channel: ChannelId, data: &[u8]) {
        for chunk in data.chunks(self.max_chunk) {
            self.send(channel, chunk.to_vec(), false);
        }
    }

    /// No more data will be sent through the channel
    pub fn close(&self, channel: ChannelId) {
        self.send(channel, Vec::new(), true);
    }

    fn send(&self, channel: ChannelId, data: Vec<u8>, eof: bool) {
        self.comm
            .get_mut()
            .send_message_to_server(FromWorkerMessage::TaskOutput(TaskOutputMsg {
                id: self.task_id,
                instance_id: self.instance_id,
                channel,
                data,
                eof,
            }));
    }
}

pub trait TaskLauncher {
    /// Creates the future that executes a task.
    /// The worker state is borrowed during this call; the returned future must not borrow it.
    fn build_task(
        &self,
        ctx: TaskBuildContext,
        stop_receiver: tokio::sync::oneshot::Receiver<StopReason>,
    ) -> crate::Result<TaskFuture>;
}

/// Create an output stream file on the given path.
/// If the path is relative, the file will be created relative to `cwd`.
fn create_output_stream(def: &StdioDef, cwd: &Path) -> crate::Result<Stdio> {
    let stdio = match def {
        StdioDef::File(path) => {
            let stream_path = if path.is_relative() {
                cwd.join(path)
            } else {
                path.clone()
            };
            let file = File::create(&stream_path).map_err(|e| {
                format!(
                    "Creating stream file {} failed: {e}",
                    stream_path.display()
                )
            })?;
            Stdio::from(file)
        }
        StdioDef::Null => Stdio::null(),
        StdioDef::Stream => Stdio::piped(),
    };
    Ok(stdio)
}

pub fn command_from_definitions(definition: &ProgramDefinition) -> crate::Result<Command> {
    if definition.args.is_empty() {
        return Err(GenericError("No command arguments".to_string()));
    }

    let mut command = Command::new(definition.args[0].to_os_str_lossy());

    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(|| {
            // Own process group, so that signals for the task do not reach the worker
            if let Err(error) = nix::unistd::setsid() {
                log::error!("Cannot set SID for task process: {error:?}");
            }
            // Send SIGTERM to this task when the parent (worker) dies.
            let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            if ret != 0 {
                log::error!("Cannot set PR_SET_PDEATHSIG for task process: {ret:?}");
            }
            Ok(())
        });
    }

    command.kill_on_drop(true);
    command.args(definition.args[1..].iter().map(|x| x.to_os_str_lossy()));

    if !definition.cwd.as_os_str().is_empty() {
        if !definition.cwd.is_dir() {
            std::fs::create_dir_all(&definition.cwd).map_err(|error| {
                GenericError(format!("Could not create working directory: {error:?}"))
            })?;
        }
        command.current_dir(&definition.cwd);
    }

    command.stdout(create_output_stream(&definition.stdout, &definition.cwd)?);
    command.stderr(create_output_stream(&definition.stderr, &definition.cwd)?);

    command.stdin(if definition.stdin.is_empty() {
        Stdio::null()
    } else {
        Stdio::piped()
    });

    for (k, v) in definition.env.iter() {
        command.env(k.to_os_str_lossy(), v.to_os_str_lossy());
    }

    Ok(command)
}
