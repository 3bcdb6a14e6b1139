//! Engine configuration: the log, the capture archive, snapshots, pings and
//! partition supervision.

use std::time::Duration;

use serde::Deserialize;

use super::StorageConfig;
use crate::capture::DEFAULT_FILE_NAME_FORMAT;
use crate::pipeline::PingSchedule;
use crate::snapshot::{SnapshotPolicy, DEFAULT_PREFIX};

/// Default number of log partitions.
pub const DEFAULT_PARTITION_COUNT: i16 = 4;

/// Default snapshot spacing in sequence numbers.
pub const DEFAULT_SNAPSHOT_EVERY: i64 = 500;

/// Default number of snapshot writes that may wait for the writer.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 4;

/// Default capacity of the channels between partition stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Live log identity and layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Namespace the log lives in. Part of capture segment names.
    pub namespace: String,
    /// Name of the log. Part of capture segment names.
    pub event_hub: String,
    /// Number of partitions, as used by the partition hasher.
    pub partition_count: i16,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            namespace: "metering".to_string(),
            event_hub: "metering".to_string(),
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

/// Capture archive configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Replay the archive when the live log no longer retains what is needed.
    pub enabled: bool,
    /// Segment name template.
    pub file_name_format: String,
    pub storage: StorageConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_name_format: DEFAULT_FILE_NAME_FORMAT.to_string(),
            storage: StorageConfig::default(),
        }
    }
}

/// Snapshot configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshot whenever the sequence number enters a new bucket of this size.
    pub every_sequence_numbers: i64,
    /// Also snapshot after this many seconds of enqueued time.
    pub every_seconds: Option<u64>,
    /// Key prefix in the snapshot store.
    pub prefix: String,
    /// Snapshot writes that may queue behind a slow store before snapshots
    /// are deferred.
    pub max_pending_writes: usize,
    pub storage: StorageConfig,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            every_sequence_numbers: DEFAULT_SNAPSHOT_EVERY,
            every_seconds: None,
            prefix: DEFAULT_PREFIX.to_string(),
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            storage: StorageConfig::default(),
        }
    }
}

impl SnapshotConfig {
    pub fn policy(&self) -> SnapshotPolicy {
        let policy = SnapshotPolicy::every_sequence_numbers(self.every_sequence_numbers);
        match self.every_seconds {
            Some(seconds) => policy.with_interval(Duration::from_secs(seconds)),
            None => policy,
        }
    }
}

/// Liveness ping configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub enabled: bool,
    /// Minute of the hour the hourly ping is sent at.
    pub minute_offset: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minute_offset: 0,
        }
    }
}

impl PingConfig {
    pub fn schedule(&self) -> Option<PingSchedule> {
        self.enabled.then(|| PingSchedule::new(self.minute_offset))
    }
}

/// Partition supervision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Capacity of each channel between the stages of a partition.
    pub channel_capacity: usize,
    /// First restart delay after a partition chain failed.
    pub restart_min_delay_ms: u64,
    /// Upper bound of the restart delay.
    pub restart_max_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            restart_min_delay_ms: 1_000,
            restart_max_delay_ms: 60_000,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_min_delay(&self) -> Duration {
        Duration::from_millis(self.restart_min_delay_ms)
    }

    pub fn restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.restart_max_delay_ms.max(self.restart_min_delay_ms))
    }
}
