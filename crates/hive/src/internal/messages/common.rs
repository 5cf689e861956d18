use serde::{Deserialize, Serialize};

/// Who is to blame for a failed task instance.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskFailKind {
    /// The task body ran and ended badly (non-zero exit code, signal, time limit)
    TaskBody,
    /// The worker running the task was lost, the outcome of the body is unknown
    WorkerLost,
    /// The task could not be started at all
    LaunchError,
}

impl std::fmt::Display for TaskFailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskFailKind::TaskBody => "task failure",
            TaskFailKind::WorkerLost => "worker lost",
            TaskFailKind::LaunchError => "launch error",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskFailInfo {
    pub kind: TaskFailKind,
    pub message: String,
}

impl TaskFailInfo {
    pub fn task_body(message: String) -> Self {
        TaskFailInfo {
            kind: TaskFailKind::TaskBody,
            message,
        }
    }

    pub fn launch_error(message: String) -> Self {
        TaskFailInfo {
            kind: TaskFailKind::LaunchError,
            message,
        }
    }

    pub fn worker_lost(message: String) -> Self {
        TaskFailInfo {
            kind: TaskFailKind::WorkerLost,
            message,
        }
    }
}
