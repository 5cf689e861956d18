use std::time::Duration;

use bstr::BString;

use hive::gateway::{ResourceRequest, RetryPolicy, WorkerInfo, WorkerRuntimeInfo};
use hive::program::ProgramDefinition;
use hive::resources::ResourceDescriptor;
use hive::worker::{ServerLostPolicy, WorkerConfiguration};

use crate::transfer::messages::{TaskDescription, TaskWithDependencies};
use crate::{DEFAULT_WORKER_GROUP_NAME, WorkerId};

pub fn program(args: &[&str]) -> ProgramDefinition {
    ProgramDefinition {
        args: args.iter().map(|arg| BString::from(*arg)).collect(),
        ..Default::default()
    }
}

pub fn task_desc() -> TaskDescription {
    TaskDescription {
        program: program(&["/bin/true"]),
        resources: ResourceRequest::default(),
        task_dir: false,
        time_limit: None,
        priority: 0,
        retry: RetryPolicy::default(),
    }
}

pub fn task_with_deps(id: u32, deps: &[u32]) -> TaskWithDependencies {
    TaskWithDependencies {
        id: id.into(),
        task_desc: task_desc(),
        dependencies: deps.iter().map(|&dep| dep.into()).collect(),
    }
}

pub fn worker_configuration(cpus: u32) -> WorkerConfiguration {
    WorkerConfiguration {
        resources: ResourceDescriptor::simple_cpus(cpus),
        listen_address: "localhost:1234".to_string(),
        hostname: "node1".to_string(),
        group: DEFAULT_WORKER_GROUP_NAME.to_string(),
        work_dir: Default::default(),
        heartbeat_interval: Duration::from_secs(8),
        idle_timeout: None,
        time_limit: None,
        on_server_lost: ServerLostPolicy::Stop,
        max_output_chunk: 0,
        extra: Default::default(),
    }
}

pub fn worker_info(id: u32, cpus: u32) -> WorkerInfo {
    WorkerInfo {
        id: WorkerId::new(id),
        configuration: worker_configuration(cpus),
        runtime: WorkerRuntimeInfo::SingleNodeTasks {
            assigned_tasks: 0,
            running_tasks: 0,
        },
    }
}
