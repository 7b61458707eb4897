//! Config loading and persistence.

mod load;
mod merge;
mod schema;

pub use load::{config_path, load, load_layer, write_config};
pub use merge::{apply_env_overrides, apply_overrides_from, merge_layers};
pub use schema::{
    AssuredConfig, AssuredConfigOverride, Config, ConfigError, ConfigLayer,
    DEFAULT_DEGRADED_STATUS_THRESHOLD, DEFAULT_DS_ASSURED_TIMEOUT_MS,
    DEFAULT_RS_ASSURED_TIMEOUT_MS, DEFAULT_WINDOW_SIZE, FileLoggingConfig,
    FileLoggingConfigOverride, LogFormat, LogRotation, LoggingConfig, LoggingConfigOverride,
    ReplicationConfig, ReplicationConfigOverride,
};
