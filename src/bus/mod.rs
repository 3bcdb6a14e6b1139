//! Live log access.
//!
//! This module contains:
//! - `LiveLog` trait: partition discovery, tailing and appends
//! - `LiveLogEvent`: what a partition subscription yields
//! - Implementations: in-memory channel log

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::model::{LogRecord, OutgoingMessage, PartitionId, SequenceNumber};
use crate::partitioning::PartitionHashError;

pub mod channel;

pub use channel::InMemoryLog;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during live log operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Unknown partition: {0}")]
    UnknownPartition(PartitionId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscriber lagged, {0} records skipped")]
    Lagged(u64),

    #[error("Append failed: {0}")]
    Append(String),

    #[error("Partition hashing failed: {0}")]
    Hash(#[from] PartitionHashError),
}

/// Where a partition subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePosition {
    /// Oldest record still retained by the log.
    Earliest,
    /// First record after the given sequence number (exclusive).
    After(SequenceNumber),
}

/// Item yielded by a partition subscription.
#[derive(Debug)]
pub enum LiveLogEvent {
    Record(LogRecord),
    /// Transport-level failure. The subscription is no longer usable.
    Error(BusError),
    /// Another consumer took over the partition.
    OwnershipLost,
}

pub type LiveLogStream = BoxStream<'static, LiveLogEvent>;

/// Client of the partitioned, append-only live log.
///
/// Implementations:
/// - `InMemoryLog`: process-local log backed by broadcast channels
#[async_trait]
pub trait LiveLog: Send + Sync {
    /// Partitions of the log.
    async fn list_partitions(&self) -> Result<Vec<PartitionId>>;

    /// Sequence number of the oldest retained record of a partition.
    ///
    /// For a partition with nothing retained, this is the sequence number the
    /// next appended record will get.
    async fn earliest_available_sequence_number(
        &self,
        partition_id: &PartitionId,
    ) -> Result<SequenceNumber>;

    /// Tail a partition from `position`. The stream ends when the
    /// subscription is released by the log.
    async fn subscribe(
        &self,
        partition_id: &PartitionId,
        position: LivePosition,
    ) -> Result<LiveLogStream>;

    /// Append a message to a partition, returning its sequence number.
    async fn append(
        &self,
        partition_id: &PartitionId,
        message: OutgoingMessage,
    ) -> Result<SequenceNumber>;
}
