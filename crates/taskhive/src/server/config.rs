use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use orion::aead::SecretKey;
use serde::{Deserialize, Serialize};

use hive::server::{
    DEFAULT_CANCEL_GRACE, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_LIVENESS_PERIOD,
    EqualPriorityPolicy, LivenessConfig, ServerOptions,
};

use crate::WorkerId;
use crate::common::access::parse_secret_key;
use crate::common::timeutils::{duration, option_duration};
use crate::stream::hub::DEFAULT_STREAM_RETENTION;

pub const DEFAULT_ACCESS_FILE: &str = "taskhive-access.json";

/// Server settings, usually read from a TOML file.
///
/// Durations are written as human readable strings, e.g. `heartbeat_timeout = "1m 30s"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Hostname announced to workers and clients; the local hostname when missing
    pub host: Option<String>,
    /// Zero selects a free port
    pub worker_port: u16,
    pub client_port: u16,
    /// Hex encoded key; a random one is generated when missing
    pub secret_key: Option<String>,
    pub disable_auth: bool,

    #[serde(with = "duration")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration")]
    pub liveness_interval: Duration,
    #[serde(with = "duration")]
    pub scheduler_min_delay: Duration,
    #[serde(with = "duration")]
    pub cancel_grace: Duration,
    /// Default idle timeout of workers that do not set their own
    #[serde(with = "option_duration")]
    pub idle_timeout: Option<Duration>,
    pub equal_priority_policy: EqualPriorityPolicy,

    /// Retained output per task channel
    pub stream_retention_bytes: usize,

    pub journal: Option<PathBuf>,
    #[serde(with = "duration")]
    pub journal_flush_period: Duration,

    #[serde(with = "duration")]
    pub allocation_hint_interval: Duration,

    pub access_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: None,
            worker_port: 0,
            client_port: 0,
            secret_key: None,
            disable_auth: false,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            liveness_interval: DEFAULT_LIVENESS_PERIOD,
            scheduler_min_delay: Duration::from_millis(20),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            idle_timeout: None,
            equal_priority_policy: EqualPriorityPolicy::default(),
            stream_retention_bytes: DEFAULT_STREAM_RETENTION,
            journal: None,
            journal_flush_period: Duration::from_secs(30),
            allocation_hint_interval: Duration::from_secs(10),
            access_file: PathBuf::from(DEFAULT_ACCESS_FILE),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> crate::Result<ServerConfig> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::Result<ServerConfig> {
        Ok(toml::from_str(content)?)
    }

    pub fn hostname(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Key used to authenticate workers and clients, `None` disables authentication
    pub fn resolve_secret_key(&self) -> crate::Result<Option<Arc<SecretKey>>> {
        if self.disable_auth {
            return Ok(None);
        }
        match &self.secret_key {
            Some(key) => Ok(Some(parse_secret_key(key)?)),
            None => Ok(Some(Arc::new(SecretKey::default()))),
        }
    }

    pub fn server_options(
        &self,
        server_uid: String,
        secret_key: Option<Arc<SecretKey>>,
        worker_id_initial_value: WorkerId,
    ) -> ServerOptions {
        ServerOptions {
            secret_key,
            scheduler_min_delay: self.scheduler_min_delay,
            idle_timeout: self.idle_timeout,
            liveness: LivenessConfig {
                heartbeat_timeout: self.heartbeat_timeout,
                cancel_grace: self.cancel_grace,
            },
            liveness_period: self.liveness_interval,
            equal_priority_policy: self.equal_priority_policy,
            resource_kinds: Vec::new(),
            server_uid,
            worker_id_initial_value,
        }
    }
}
