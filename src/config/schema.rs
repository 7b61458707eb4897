use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    AssuredMode, AssuredRequest, GenerationId, GroupId, PeerInfo, PeerKind, ServerId,
};

pub const DEFAULT_DS_ASSURED_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RS_ASSURED_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_DEGRADED_STATUS_THRESHOLD: usize = 5_000;
pub const DEFAULT_WINDOW_SIZE: u32 = 100;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.replication.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub server_id: ServerId,
    pub kind: PeerKind,
    pub group_id: GroupId,
    pub generation_id: GenerationId,
    /// Unset means 2000 ms on a directory server and 1000 ms on a relay,
    /// so a relay gives up and answers before the originator does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assured_timeout_ms: Option<u64>,
    /// Backlog at which a peer is demoted to degraded. 0 disables.
    pub degraded_status_threshold: usize,
    pub window_size: u32,
    pub assured: AssuredConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId::new(1),
            kind: PeerKind::Ds,
            group_id: GroupId::DEFAULT,
            generation_id: GenerationId::new(0),
            assured_timeout_ms: None,
            degraded_status_threshold: DEFAULT_DEGRADED_STATUS_THRESHOLD,
            window_size: DEFAULT_WINDOW_SIZE,
            assured: AssuredConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn assured_timeout(&self) -> Duration {
        let ms = self.assured_timeout_ms.unwrap_or(match self.kind {
            PeerKind::Ds => DEFAULT_DS_ASSURED_TIMEOUT_MS,
            PeerKind::Rs => DEFAULT_RS_ASSURED_TIMEOUT_MS,
        });
        Duration::from_millis(ms)
    }

    pub fn local_peer(&self) -> PeerInfo {
        PeerInfo::new(self.server_id, self.kind, self.group_id, self.generation_id)
    }

    /// Assured request applied to local writes, if enabled.
    pub fn default_request(&self) -> Result<Option<AssuredRequest>, ConfigError> {
        self.assured.request()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.get() == 0 {
            return Err(ConfigError::Invalid {
                field: "replication.server_id",
                reason: "must be positive".into(),
            });
        }
        if self.window_size == 0 {
            return Err(ConfigError::Invalid {
                field: "replication.window_size",
                reason: "must be positive".into(),
            });
        }
        if self.assured_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "replication.assured_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        self.assured.request().map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssuredConfig {
    pub enabled: bool,
    pub mode: AssuredMode,
    pub safe_data_level: u8,
}

impl Default for AssuredConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AssuredMode::SafeData,
            safe_data_level: 1,
        }
    }
}

impl AssuredConfig {
    pub fn request(&self) -> Result<Option<AssuredRequest>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        match self.mode {
            AssuredMode::SafeRead => Ok(Some(AssuredRequest::SafeRead)),
            AssuredMode::SafeData => AssuredRequest::safe_data(self.safe_data_level)
                .map(Some)
                .map_err(|err| ConfigError::Invalid {
                    field: "replication.assured.safe_data_level",
                    reason: err.to_string(),
                }),
        }
    }
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
    Minutely,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}

/// A partial config file. Every field is optional and only set fields
/// override the layer below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub replication: ReplicationConfigOverride,
    pub logging: LoggingConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.replication.apply_to(&mut base.replication);
        self.logging.apply_to(&mut base.logging);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfigOverride {
    pub server_id: Option<ServerId>,
    pub kind: Option<PeerKind>,
    pub group_id: Option<GroupId>,
    pub generation_id: Option<GenerationId>,
    pub assured_timeout_ms: Option<u64>,
    pub degraded_status_threshold: Option<usize>,
    pub window_size: Option<u32>,
    pub assured: Option<AssuredConfigOverride>,
}

impl ReplicationConfigOverride {
    pub fn apply_to(&self, target: &mut ReplicationConfig) {
        if let Some(server_id) = self.server_id {
            target.server_id = server_id;
        }
        if let Some(kind) = self.kind {
            target.kind = kind;
        }
        if let Some(group_id) = self.group_id {
            target.group_id = group_id;
        }
        if let Some(generation_id) = self.generation_id {
            target.generation_id = generation_id;
        }
        if let Some(timeout) = self.assured_timeout_ms {
            target.assured_timeout_ms = Some(timeout);
        }
        if let Some(threshold) = self.degraded_status_threshold {
            target.degraded_status_threshold = threshold;
        }
        if let Some(window) = self.window_size {
            target.window_size = window;
        }
        if let Some(assured) = self.assured.as_ref() {
            assured.apply_to(&mut target.assured);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssuredConfigOverride {
    pub enabled: Option<bool>,
    pub mode: Option<AssuredMode>,
    pub safe_data_level: Option<u8>,
}

impl AssuredConfigOverride {
    pub fn apply_to(&self, target: &mut AssuredConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(mode) = self.mode {
            target.mode = mode;
        }
        if let Some(level) = self.safe_data_level {
            target.safe_data_level = level;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
    }
}
