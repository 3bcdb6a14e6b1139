//! In-memory channel-based live log.
//!
//! Uses one tokio broadcast channel per partition for live tails, plus a
//! retained record list that subscribers replay before switching to the
//! channel. Retention can be shortened with [`InMemoryLog::purge_before`] to
//! simulate records ageing out to the capture archive.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use super::{BusError, LiveLog, LiveLogEvent, LiveLogStream, LivePosition, Result};
use crate::model::{LogRecord, OutgoingMessage, PartitionId, SequenceNumber};
use crate::partitioning::PartitionHasher;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// Offset increment per record, mimicking byte offsets.
const OFFSET_STRIDE: i64 = 64;

#[derive(Debug, Clone)]
enum Delivery {
    Record(LogRecord),
    Fault(String),
    Revoke,
}

#[derive(Default)]
struct PartitionState {
    records: Vec<LogRecord>,
    next_sequence_number: SequenceNumber,
}

struct PartitionLog {
    state: Mutex<PartitionState>,
    sender: broadcast::Sender<Delivery>,
}

impl PartitionLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(PartitionState::default()),
            sender,
        }
    }
}

/// In-memory live log with a fixed number of partitions `"0"..`.
pub struct InMemoryLog {
    partitions: BTreeMap<PartitionId, PartitionLog>,
    hasher: PartitionHasher,
}

impl InMemoryLog {
    pub fn new(partition_count: i16) -> Result<Self> {
        let hasher = PartitionHasher::new(partition_count)?;
        let partitions = (0..partition_count as usize)
            .map(|i| (PartitionId::from(i), PartitionLog::new()))
            .collect();

        info!(partition_count, "In-memory live log initialized");

        Ok(Self { partitions, hasher })
    }

    fn partition(&self, partition_id: &PartitionId) -> Result<&PartitionLog> {
        self.partitions
            .get(partition_id)
            .ok_or_else(|| BusError::UnknownPartition(partition_id.clone()))
    }

    /// Publish a keyed message, routed by the partition hasher.
    pub async fn publish(
        &self,
        partition_key: &str,
        body: impl Into<Bytes>,
    ) -> Result<(PartitionId, SequenceNumber)> {
        let partition_id = PartitionId::from(self.hasher.assign(Some(partition_key)) as usize);
        let message = OutgoingMessage::new(body).with_partition_key(partition_key);
        let sequence_number = self.append_at(&partition_id, message, Utc::now()).await?;
        Ok((partition_id, sequence_number))
    }

    /// Append with an explicit enqueued time.
    pub async fn append_at(
        &self,
        partition_id: &PartitionId,
        message: OutgoingMessage,
        enqueued_time: DateTime<Utc>,
    ) -> Result<SequenceNumber> {
        let partition = self.partition(partition_id)?;
        let mut state = partition.state.lock().await;

        let sequence_number = state.next_sequence_number;
        state.next_sequence_number += 1;
        let record = LogRecord {
            sequence_number,
            offset: sequence_number * OFFSET_STRIDE,
            enqueued_time,
            partition_key: message.partition_key.unwrap_or_default(),
            properties: message.properties,
            body: message.body,
        };
        state.records.push(record.clone());

        // No receivers is fine: nobody is tailing yet.
        let receivers = partition.sender.send(Delivery::Record(record)).unwrap_or(0);
        debug!(partition_id = %partition_id, sequence_number, receivers, "Appended record");

        Ok(sequence_number)
    }

    /// Retained records of a partition.
    pub async fn records(&self, partition_id: &PartitionId) -> Result<Vec<LogRecord>> {
        Ok(self.partition(partition_id)?.state.lock().await.records.clone())
    }

    /// Drop retained records older than `sequence_number`, returning them.
    pub async fn purge_before(
        &self,
        partition_id: &PartitionId,
        sequence_number: SequenceNumber,
    ) -> Result<Vec<LogRecord>> {
        let mut state = self.partition(partition_id)?.state.lock().await;
        let keep_from = state
            .records
            .iter()
            .position(|r| r.sequence_number >= sequence_number)
            .unwrap_or(state.records.len());
        let purged: Vec<LogRecord> = state.records.drain(..keep_from).collect();

        info!(partition_id = %partition_id, purged = purged.len(), "Purged retained records");

        Ok(purged)
    }

    /// Fail every current subscription of a partition with a transport error.
    pub fn inject_fault(&self, partition_id: &PartitionId, message: impl Into<String>) -> Result<()> {
        let _ = self.partition(partition_id)?.sender.send(Delivery::Fault(message.into()));
        Ok(())
    }

    /// Tell every current subscriber of a partition that it lost ownership.
    pub fn revoke_ownership(&self, partition_id: &PartitionId) -> Result<()> {
        let _ = self.partition(partition_id)?.sender.send(Delivery::Revoke);
        Ok(())
    }

    /// Number of live subscriptions on a partition.
    pub fn subscriber_count(&self, partition_id: &PartitionId) -> Result<usize> {
        Ok(self.partition(partition_id)?.sender.receiver_count())
    }
}

#[async_trait]
impl LiveLog for InMemoryLog {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>> {
        Ok(self.partitions.keys().cloned().collect())
    }

    async fn earliest_available_sequence_number(
        &self,
        partition_id: &PartitionId,
    ) -> Result<SequenceNumber> {
        let state = self.partition(partition_id)?.state.lock().await;
        Ok(state
            .records
            .first()
            .map(|r| r.sequence_number)
            .unwrap_or(state.next_sequence_number))
    }

    #[tracing::instrument(name = "log.subscribe", skip_all, fields(partition_id = %partition_id))]
    async fn subscribe(
        &self,
        partition_id: &PartitionId,
        position: LivePosition,
    ) -> Result<LiveLogStream> {
        let partition = self.partition(partition_id)?;

        // Take the backlog and join the channel under one lock so no append
        // falls between them.
        let (backlog, receiver) = {
            let state = partition.state.lock().await;
            let backlog: Vec<LogRecord> = state
                .records
                .iter()
                .filter(|r| match position {
                    LivePosition::Earliest => true,
                    LivePosition::After(n) => r.sequence_number > n,
                })
                .cloned()
                .collect();
            (backlog, partition.sender.subscribe())
        };

        let cutoff = backlog
            .last()
            .map(|r| r.sequence_number)
            .or(match position {
                LivePosition::Earliest => None,
                LivePosition::After(n) => Some(n),
            });

        debug!(backlog = backlog.len(), ?position, "Subscribed to partition");

        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = match item {
                Ok(Delivery::Record(record)) => {
                    if cutoff.map_or(true, |c| record.sequence_number > c) {
                        Some(LiveLogEvent::Record(record))
                    } else {
                        None
                    }
                }
                Ok(Delivery::Fault(message)) => Some(LiveLogEvent::Error(BusError::Transport(message))),
                Ok(Delivery::Revoke) => Some(LiveLogEvent::OwnershipLost),
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(LiveLogEvent::Error(BusError::Lagged(n))),
            };
            futures::future::ready(event)
        });

        Ok(futures::stream::iter(backlog.into_iter().map(LiveLogEvent::Record))
            .chain(live)
            .boxed())
    }

    async fn append(
        &self,
        partition_id: &PartitionId,
        message: OutgoingMessage,
    ) -> Result<SequenceNumber> {
        self.append_at(partition_id, message, Utc::now()).await
    }
}

#[cfg(test)]
mod tests;
