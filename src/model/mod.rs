//! Core data model shared by every stage of a partition chain.
//!
//! Records from the capture archive and from the live log are unified into
//! [`LogRecord`], so the fold input is independent of where a record came
//! from. [`EventSource`] is carried alongside for diagnostics only.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::StartingPosition;

/// Sequence number of a record within one partition.
pub type SequenceNumber = i64;

/// Reserved system property carrying the partition key of a record.
pub const PARTITION_KEY_PROPERTY: &str = "x-opt-partition-key";

/// Identifier of one physical log partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric index of the partition, when the identifier is numeric.
    pub fn index(&self) -> Option<usize> {
        self.0.parse().ok()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<usize> for PartitionId {
    fn from(value: usize) -> Self {
        Self::new(value.to_string())
    }
}

/// Cursor identifying a point in a partition's history.
///
/// Ordered by sequence number within a partition. Used both as the resume
/// cursor and as the snapshot key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePosition {
    pub partition_id: PartitionId,
    pub sequence_number: SequenceNumber,
    pub enqueued_time: DateTime<Utc>,
}

impl MessagePosition {
    pub fn new(
        partition_id: PartitionId,
        sequence_number: SequenceNumber,
        enqueued_time: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_id,
            sequence_number,
            enqueued_time,
        }
    }
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}",
            self.partition_id,
            self.sequence_number,
            self.enqueued_time.to_rfc3339()
        )
    }
}

/// Raw record as read from either the archive or the live log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub sequence_number: SequenceNumber,
    pub offset: i64,
    pub enqueued_time: DateTime<Utc>,
    pub partition_key: String,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl LogRecord {
    pub fn position(&self, partition_id: &PartitionId) -> MessagePosition {
        MessagePosition::new(
            partition_id.clone(),
            self.sequence_number,
            self.enqueued_time,
        )
    }
}

/// Where an observed record was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    Capture { segment: String },
    LiveLog,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Capture { segment } => write!(f, "capture:{}", segment),
            EventSource::LiveLog => f.write_str("live"),
        }
    }
}

/// A record as seen by the fold: the raw record plus its partition and source.
#[derive(Debug, Clone)]
pub struct ObservedRecord {
    pub partition_id: PartitionId,
    pub record: LogRecord,
    pub source: EventSource,
}

impl ObservedRecord {
    pub fn position(&self) -> MessagePosition {
        self.record.position(&self.partition_id)
    }
}

/// Event emitted by a partition pipeline into its fold stage.
///
/// `Initializing` carries the state restored from the latest snapshot, so
/// that the fold is seeded without a side channel.
#[derive(Debug, Clone)]
pub enum PartitionEvent<S> {
    Initializing {
        partition_id: PartitionId,
        starting_position: StartingPosition,
        initial_state: Option<S>,
    },
    Record(ObservedRecord),
    Error {
        partition_id: PartitionId,
        message: String,
    },
    Closing {
        partition_id: PartitionId,
        reason: CloseReason,
    },
}

/// Why a partition pipeline left the live-tailing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    OwnershipLost,
    StreamEnded,
    Failed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::OwnershipLost => "ownership lost",
            CloseReason::StreamEnded => "stream ended",
            CloseReason::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Message appended to the live log by the engine itself (pings, acknowledgements).
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub partition_key: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            partition_key: None,
            properties: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_partition_id_index() {
        assert_eq!(PartitionId::from(3usize).index(), Some(3));
        assert_eq!(PartitionId::new("p-1").index(), None);
    }

    #[test]
    fn test_partition_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PartitionId::new("7")).unwrap();
        assert_eq!(json, "\"7\"");
    }

    #[test]
    fn test_record_position_carries_partition() {
        let at = Utc.with_ymd_and_hms(2021, 12, 2, 14, 58, 24).unwrap();
        let record = LogRecord {
            sequence_number: 42,
            offset: 4200,
            enqueued_time: at,
            partition_key: String::new(),
            properties: BTreeMap::new(),
            body: Bytes::new(),
        };

        let position = record.position(&PartitionId::new("2"));

        assert_eq!(position.partition_id.as_str(), "2");
        assert_eq!(position.sequence_number, 42);
        assert_eq!(position.enqueued_time, at);
    }
}
