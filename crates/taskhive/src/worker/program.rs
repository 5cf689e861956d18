use std::future::Future;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use bstr::{BString, ByteSlice};
use futures::TryFutureExt;
use futures::future::Either;
use nix::sys::signal::{self, Signal};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot::Receiver;

use hive::TaskId;
use hive::launcher::{
    OutputStream, StopReason, TaskBuildContext, TaskFuture, TaskResult, command_from_definitions,
};
use hive::program::{ProgramDefinition, StdioDef};
use hive::resources::{CPU_RESOURCE_NAME, ResourceAllocation};
use hive::worker::{ChannelId, STDERR_CHANNEL, STDOUT_CHANNEL};

use crate::common::env::{
    HIVE_CPUS, HIVE_ENTRY, HIVE_INSTANCE_ID, HIVE_JOB_ID, HIVE_NODE_FILE, HIVE_NODE_LIST,
    HIVE_NUM_NODES, HIVE_RESOURCE_PREFIX, HIVE_TASK_DIR, HIVE_TASK_ID,
};
use crate::transfer::messages::TaskBody;

const STDIO_BUFFER_SIZE: usize = 16 * 1024;

const NODE_FILE_NAME: &str = "hive-nodefile";

pub(super) fn build_program_task(
    ctx: TaskBuildContext,
    stop_receiver: Receiver<StopReason>,
    body: TaskBody,
    kill_grace: Duration,
) -> hive::Result<TaskFuture> {
    let TaskBody {
        mut program,
        task_dir,
        entry,
    } = body;
    let task_id = ctx.task_id();

    program.env.insert(
        HIVE_JOB_ID.into(),
        task_id.job_id().to_string().into(),
    );
    program.env.insert(
        HIVE_TASK_ID.into(),
        task_id.job_task_id().to_string().into(),
    );
    program.env.insert(
        HIVE_INSTANCE_ID.into(),
        ctx.instance_id().to_string().into(),
    );
    if let Some(entry) = entry {
        program.env.insert(HIVE_ENTRY.into(), entry);
    }

    let multi_node = !ctx.node_list().is_empty();
    let task_dir = if task_dir || multi_node {
        let work_dir = &ctx.worker_configuration().work_dir;
        let dir = TempDir::with_prefix_in("t", work_dir).map_err(|error| {
            format!(
                "Cannot create task directory in {}: {error}",
                work_dir.display()
            )
        })?;
        program.env.insert(
            HIVE_TASK_DIR.into(),
            dir.path().to_string_lossy().to_string().into(),
        );
        Some(dir)
    } else {
        None
    };

    match &task_dir {
        Some(dir) if multi_node => insert_node_list_into_env(&ctx, &mut program, dir.path())?,
        _ => insert_resources_into_env(&ctx, &mut program),
    }

    create_directory_if_needed(&program.stdout)
        .map_err(|error| format!("Cannot create stdout directory: {error}"))?;
    create_directory_if_needed(&program.stderr)
        .map_err(|error| format!("Cannot create stderr directory: {error}"))?;

    let output = ctx.output_stream();
    Ok(Box::pin(create_task_future(
        program,
        task_id,
        stop_receiver,
        task_dir,
        output,
        kill_grace,
    )))
}

fn create_directory_if_needed(file: &StdioDef) -> std::io::Result<()> {
    if let StdioDef::File(path) = file {
        if let Some(path) = path.parent() {
            std::fs::create_dir_all(path)?;
        }
    }
    Ok(())
}

fn insert_node_list_into_env(
    ctx: &TaskBuildContext,
    program: &mut ProgramDefinition,
    task_dir: &Path,
) -> hive::Result<()> {
    let nodes = ctx.node_list();
    program
        .env
        .insert(HIVE_NUM_NODES.into(), nodes.len().to_string().into());
    program
        .env
        .insert(HIVE_NODE_LIST.into(), nodes.join(",").into());

    let filename = task_dir.join(NODE_FILE_NAME);
    write_node_file(nodes, &filename).map_err(|error| {
        format!(
            "Cannot write node file at {}: {error}",
            filename.display()
        )
    })?;
    program.env.insert(
        HIVE_NODE_FILE.into(),
        filename.to_string_lossy().to_string().into(),
    );
    Ok(())
}

fn write_node_file(nodes: &[String], path: &Path) -> std::io::Result<()> {
    let mut file = BufWriter::new(std::fs::File::create(path)?);
    for node in nodes {
        file.write_all(node.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()
}

fn insert_resources_into_env(ctx: &TaskBuildContext, program: &mut ProgramDefinition) {
    let resource_map = ctx.get_resource_map();
    for allocation in &ctx.allocation().resources {
        let Some(name) = resource_map.get_name(allocation.resource_id) else {
            continue;
        };
        let value = allocation_value(allocation);
        if name == CPU_RESOURCE_NAME {
            program.env.insert(HIVE_CPUS.into(), value.clone().into());
            if !program.env.contains_key(b"OMP_NUM_THREADS".as_bstr()) {
                program.env.insert(
                    "OMP_NUM_THREADS".into(),
                    allocation.amount.to_string().into(),
                );
            }
        }
        program
            .env
            .insert(resource_env_var_name(name), value.into());
    }
}

/// Indices for indexed resources, the amount for sum resources
fn allocation_value(allocation: &ResourceAllocation) -> String {
    if allocation.indices.is_empty() {
        allocation.amount.to_string()
    } else {
        allocation.comma_delimited_indices()
    }
}

/// Special characters are replaced by `_` and letters are uppercased, so that the name
/// can be used in shells.
fn resource_env_var_name(resource_name: &str) -> BString {
    let mut bytes = Vec::with_capacity(HIVE_RESOURCE_PREFIX.len() + resource_name.len());
    bytes.extend_from_slice(HIVE_RESOURCE_PREFIX.as_bytes());
    bytes.extend(resource_name.bytes().map(|c| match c {
        b'a'..=b'z' => c.to_ascii_uppercase(),
        b'A'..=b'Z' | b'0'..=b'9' => c,
        _ => b'_',
    }));
    bytes.into()
}

/// Provides a more detailed error message when a process fails to be spawned.
fn map_spawn_error(error: std::io::Error, program: &ProgramDefinition) -> hive::Error {
    let context = match error.kind() {
        ErrorKind::NotFound => "\nThe program was not found.",
        ErrorKind::PermissionDenied => "\nThe program is not executable.",
        _ => "",
    };
    hive::Error::GenericError(format!(
        "Cannot execute {:?}: {error}{context}",
        program
            .args
            .iter()
            .map(|arg| arg.to_str_lossy())
            .collect::<Vec<_>>()
            .join(" "),
    ))
}

async fn forward_stdio(
    task_id: TaskId,
    channel: ChannelId,
    stdio: Option<impl tokio::io::AsyncRead + Unpin>,
    output: OutputStream,
) -> std::io::Result<()> {
    if let Some(mut stdio) = stdio {
        log::debug!("Streaming channel {channel} of task {task_id}");
        let mut buffer = vec![0; STDIO_BUFFER_SIZE];
        loop {
            let size = stdio.read(&mut buffer).await?;
            if size == 0 {
                break;
            }
            output.send_data(channel, &buffer[..size]);
        }
        output.close(channel);
    }
    Ok(())
}

async fn write_stdin(mut stdin: tokio::process::ChildStdin, stdin_data: &[u8]) {
    log::debug!("Writing {} bytes on task stdin", stdin_data.len());
    if let Err(error) = stdin.write_all(stdin_data).await {
        log::debug!("Writing stdin data failed: {error}");
    }
    drop(stdin);
    futures::future::pending::<()>().await;
}

async fn child_wait(
    child: &mut tokio::process::Child,
    stdin_data: &[u8],
) -> std::io::Result<ExitStatus> {
    match child.stdin.take() {
        Some(stdin) => {
            tokio::select! {
                () = write_stdin(stdin, stdin_data) => unreachable!(),
                r = child.wait() => r,
            }
        }
        None => child.wait().await,
    }
}

fn status_to_result(status: ExitStatus) -> hive::Result<TaskResult> {
    if status.success() {
        return Ok(TaskResult::Finished);
    }
    let mut message = match status.code() {
        Some(code) => format!("Program terminated with exit code {code}."),
        None => "Program terminated abnormally.".to_string(),
    };
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(number) = status.signal() {
            let name = Signal::try_from(number)
                .map(|signal| signal.as_str())
                .unwrap_or("unknown");
            message.push_str(&format!(" Received signal {number} ({name})."));
        }
    }
    Err(hive::Error::GenericError(message))
}

async fn create_task_future(
    program: ProgramDefinition,
    task_id: TaskId,
    stop_receiver: Receiver<StopReason>,
    task_dir: Option<TempDir>,
    output: OutputStream,
    kill_grace: Duration,
) -> hive::Result<TaskResult> {
    let mut command = command_from_definitions(&program)?;
    log::trace!("Running command {command:?}");

    let mut child = command
        .spawn()
        .map_err(|error| map_spawn_error(error, &program))?;
    let Some(pid) = child.id() else {
        return Ok(TaskResult::Finished);
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let main_fut = async move {
        let (status, _, _) = tokio::try_join!(
            child_wait(&mut child, &program.stdin),
            forward_stdio(task_id, STDOUT_CHANNEL, stdout, output.clone()),
            forward_stdio(task_id, STDERR_CHANNEL, stderr, output),
        )
        .map_err(hive::Error::from)?;
        status_to_result(status)
    };
    let result = handle_task_with_signals(main_fut, pid, task_id, stop_receiver, kill_grace)
        .await;

    if let Some(dir) = task_dir {
        let path = dir.path().to_path_buf();
        if let Err(error) = dir.close() {
            log::warn!(
                "Cannot remove task directory {}: {error}",
                path.display()
            );
        }
    }
    result
}

fn send_signal(pid: u32, signal: Signal) -> hive::Result<()> {
    // The task runs in its own session, so its process group id is its pid
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    signal::killpg(pgid, Some(signal))
        .map_err(|error| format!("Cannot send signal {signal} to PGID {pgid}: {error}"))?;
    Ok(())
}

/// Waits for the task process while reacting to stop requests.
///
/// On a stop request the process group receives SIGTERM, and SIGKILL if it is still
/// alive after `kill_grace`.
async fn handle_task_with_signals<F: Future<Output = hive::Result<TaskResult>>>(
    task_future: F,
    pid: u32,
    task_id: TaskId,
    stop_receiver: Receiver<StopReason>,
    kill_grace: Duration,
) -> hive::Result<TaskResult> {
    let stop_fut = stop_receiver.map_err(|_| hive::Error::from("Stop channel was closed"));

    futures::pin_mut!(stop_fut);
    futures::pin_mut!(task_future);

    match futures::future::select(stop_fut, task_future).await {
        Either::Left((Ok(reason), task_future)) => {
            log::debug!("Stopping task {task_id} ({reason:?}) with SIGTERM");
            if let Err(error) = send_signal(pid, Signal::SIGTERM) {
                log::debug!("{error}");
            }
            if tokio::time::timeout(kill_grace, task_future).await.is_err() {
                match send_signal(pid, Signal::SIGKILL) {
                    Ok(()) => log::debug!("Task {task_id} was killed"),
                    Err(error) => log::error!("Unable to kill task {task_id}: {error}"),
                }
            } else {
                log::debug!("Task {task_id} has ended gracefully after a signal");
            }
            Ok(reason.into())
        }
        // The worker dropped the stop sender, the task keeps running
        Either::Left((Err(_), task_future)) => task_future.await,
        Either::Right((result, _)) => {
            log::debug!("Task {task_id} has finished normally");
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::program;
    use tokio::sync::oneshot;

    #[test]
    fn test_resource_env_var_name() {
        assert_eq!(resource_env_var_name("gpus/nvidia"), "HIVE_RESOURCE_GPUS_NVIDIA");
        assert_eq!(resource_env_var_name("mem"), "HIVE_RESOURCE_MEM");
    }

    #[test]
    fn test_write_node_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NODE_FILE_NAME);
        write_node_file(&["a".to_string(), "b.cluster".to_string()], &path).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a\nb.cluster\n");
    }

    #[test]
    fn test_failed_status() {
        use std::os::unix::process::ExitStatusExt;
        let error = status_to_result(ExitStatus::from_raw(3 << 8)).unwrap_err();
        assert!(error.to_string().contains("exit code 3"));
        let error = status_to_result(ExitStatus::from_raw(9)).unwrap_err();
        assert!(error.to_string().contains("SIGKILL"));
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace() {
        let definition = program(&["sh", "-c", "trap '' TERM; sleep 30"]);
        let mut command = command_from_definitions(&definition).unwrap();
        let mut child = command.spawn().unwrap();
        let pid = child.id().unwrap();
        let (sender, receiver) = oneshot::channel();

        let task = async move {
            let status = child.wait().await?;
            status_to_result(status)
        };
        sender.send(StopReason::Cancel).unwrap();
        let start = std::time::Instant::now();
        let result = handle_task_with_signals(
            task,
            pid,
            TaskId::new_test(1),
            receiver,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(matches!(result, TaskResult::Canceled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_finished_task_is_not_signaled() {
        let definition = program(&["true"]);
        let mut child = command_from_definitions(&definition).unwrap().spawn().unwrap();
        let pid = child.id().unwrap();
        let (_sender, receiver) = oneshot::channel();
        let task = async move { status_to_result(child.wait().await?) };
        let result = handle_task_with_signals(
            task,
            pid,
            TaskId::new_test(1),
            receiver,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(matches!(result, TaskResult::Finished));
    }
}
