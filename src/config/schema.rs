use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Limits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub limits: Limits,
    pub replication: ReplicationConfig,
    pub lanes: LanesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    /// `EnvFilter` directives; wins over the verbosity default.
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("logs"),
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_files: Some(10),
        }
    }
}

/// Which side of the replication stream this server plays. Fixed for the
/// lifetime of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    #[default]
    Active,
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub role: ServerRole,
    /// Active only: whether live traffic is replicated at all.
    pub enabled: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            role: ServerRole::Active,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    pub workers: usize,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

/// One config file: every field optional, applied over a `Config`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub logging: LoggingConfigOverride,
    pub limits: LimitsOverride,
    pub replication: ReplicationConfigOverride,
    pub lanes: LanesConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.logging.apply_to(&mut base.logging);
        self.limits.apply_to(&mut base.limits);
        self.replication.apply_to(&mut base.replication);
        self.lanes.apply_to(&mut base.lanes);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = dir.clone();
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_frame_bytes: Option<usize>,
    pub max_payload_bytes: Option<usize>,

    pub max_lane_queue_depth: Option<usize>,

    pub max_sync_buffer_ops: Option<usize>,
    pub max_sync_buffer_bytes: Option<usize>,

    pub repl_channel_capacity: Option<usize>,
    pub passive_ack_timeout_ms: Option<u64>,
    pub max_ack_batch: Option<usize>,

    pub max_cbor_depth: Option<usize>,
    pub max_cbor_map_entries: Option<usize>,
    pub max_cbor_array_entries: Option<usize>,
    pub max_cbor_bytes_string_len: Option<usize>,
    pub max_cbor_text_string_len: Option<usize>,
}

impl LimitsOverride {
    pub fn apply_to(&self, limits: &mut Limits) {
        if let Some(value) = self.max_frame_bytes {
            limits.max_frame_bytes = value;
        }
        if let Some(value) = self.max_payload_bytes {
            limits.max_payload_bytes = value;
        }

        if let Some(value) = self.max_lane_queue_depth {
            limits.max_lane_queue_depth = value;
        }

        if let Some(value) = self.max_sync_buffer_ops {
            limits.max_sync_buffer_ops = value;
        }
        if let Some(value) = self.max_sync_buffer_bytes {
            limits.max_sync_buffer_bytes = value;
        }

        if let Some(value) = self.repl_channel_capacity {
            limits.repl_channel_capacity = value;
        }
        if let Some(value) = self.passive_ack_timeout_ms {
            limits.passive_ack_timeout_ms = value;
        }
        if let Some(value) = self.max_ack_batch {
            limits.max_ack_batch = value;
        }

        if let Some(value) = self.max_cbor_depth {
            limits.max_cbor_depth = value;
        }
        if let Some(value) = self.max_cbor_map_entries {
            limits.max_cbor_map_entries = value;
        }
        if let Some(value) = self.max_cbor_array_entries {
            limits.max_cbor_array_entries = value;
        }
        if let Some(value) = self.max_cbor_bytes_string_len {
            limits.max_cbor_bytes_string_len = value;
        }
        if let Some(value) = self.max_cbor_text_string_len {
            limits.max_cbor_text_string_len = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplicationConfigOverride {
    pub role: Option<ServerRole>,
    pub enabled: Option<bool>,
}

impl ReplicationConfigOverride {
    pub fn apply_to(&self, target: &mut ReplicationConfig) {
        if let Some(role) = self.role {
            target.role = role;
        }
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LanesConfigOverride {
    pub workers: Option<usize>,
}

impl LanesConfigOverride {
    pub fn apply_to(&self, target: &mut LanesConfig) {
        if let Some(workers) = self.workers {
            target.workers = workers.max(1);
        }
    }
}
