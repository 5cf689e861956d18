use crate::internal::common::Map;
use crate::internal::common::resources::ResourceDescriptor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What happens with running tasks when the connection to the server is lost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ServerLostPolicy {
    #[default]
    Stop,
    FinishRunning,
}

pub const DEFAULT_WORKER_GROUP: &str = "default";
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerConfiguration {
    pub resources: ResourceDescriptor,

    pub listen_address: String,
    pub hostname: String,
    /// Multi-node tasks span only workers of the same group
    pub group: String,
    pub work_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Option<Duration>,
    /// Remaining lifetime of the worker at the time of its registration
    pub time_limit: Option<Duration>,
    pub on_server_lost: ServerLostPolicy,
    /// Upper bound of a single output chunk sent to the server
    pub max_output_chunk: usize,

    pub extra: Map<String, String>,
}

/// This function is used from both the server and the worker to keep the same values
/// in the worker configuration without the need for repeated configuration exchange.
pub(crate) fn sync_worker_configuration(
    configuration: &mut WorkerConfiguration,
    server_idle_timeout: Option<Duration>,
) {
    if configuration.idle_timeout.is_none() {
        configuration.idle_timeout = server_idle_timeout;
    }
    if configuration.max_output_chunk == 0 {
        configuration.max_output_chunk = DEFAULT_MAX_CHUNK_SIZE;
    }
}
