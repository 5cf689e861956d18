//! Environment variables passed to task processes.

pub const HIVE_JOB_ID: &str = "HIVE_JOB_ID";
pub const HIVE_TASK_ID: &str = "HIVE_TASK_ID";
pub const HIVE_INSTANCE_ID: &str = "HIVE_INSTANCE_ID";
pub const HIVE_ENTRY: &str = "HIVE_ENTRY";
pub const HIVE_CPUS: &str = "HIVE_CPUS";
pub const HIVE_RESOURCE_PREFIX: &str = "HIVE_RESOURCE_";
pub const HIVE_TASK_DIR: &str = "HIVE_TASK_DIR";
pub const HIVE_NODE_FILE: &str = "HIVE_NODE_FILE";
pub const HIVE_NODE_LIST: &str = "HIVE_NODE_LIST";
pub const HIVE_NUM_NODES: &str = "HIVE_NUM_NODES";
