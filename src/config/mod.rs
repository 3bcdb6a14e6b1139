//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod billing;
mod engine;
mod storage;

pub use billing::{
    BillingConfig, SubmissionConfig, DEFAULT_BILLING_API_VERSION, DEFAULT_BILLING_ENDPOINT,
};
pub use engine::{
    CaptureConfig, LogConfig, PingConfig, SnapshotConfig, SupervisorConfig,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_WRITES, DEFAULT_PARTITION_COUNT,
    DEFAULT_SNAPSHOT_EVERY,
};
pub use storage::{StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "METERING_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "METERING";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "METERING_LOG";
/// Environment variable selecting the log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "METERING_LOG_FORMAT";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Live log identity and partition count.
    pub log: LogConfig,
    /// Capture archive.
    pub capture: CaptureConfig,
    /// Snapshot policy and store.
    pub snapshot: SnapshotConfig,
    /// Billing API and submission cadence.
    pub submission: SubmissionConfig,
    /// Liveness pings.
    pub ping: PingConfig,
    /// Partition supervision.
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
