//! Config loading and persistence.

mod load;
mod merge;
mod schema;

pub use load::{ConfigError, load, load_layer, write_config};
pub use merge::{ENV_LOG, ENV_PASSIVE_ACK_TIMEOUT_MS, ENV_WORKERS, apply_env_overrides, merge_layers};
pub use schema::{
    Config, ConfigLayer, FileLoggingConfig, FileLoggingConfigOverride, LanesConfig,
    LanesConfigOverride, LimitsOverride, LogFormat, LogRotation, LoggingConfig,
    LoggingConfigOverride, ReplicationConfig, ReplicationConfigOverride, ServerRole,
};
