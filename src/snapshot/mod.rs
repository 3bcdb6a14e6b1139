//! Snapshot scheduling and storage.
//!
//! A snapshot is a serialized aggregation state keyed by the position of the
//! last record folded into it. Snapshots bound how far a partition has to
//! replay on restart; losing one only costs replay time, so writes are handed
//! off to a bounded writer and skipped when the writer falls behind.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fold::AggregationState;
use crate::model::{MessagePosition, PartitionId, SequenceNumber};
use crate::storage::{BlobStore, StorageError};

/// Default snapshot key prefix.
pub const DEFAULT_PREFIX: &str = "snapshots";

const KEY_SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State has no position yet")]
    NoPosition,
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

// ============================================================================
// Policy
// ============================================================================

/// Decides when a state is worth persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    every_sequence_numbers: i64,
    every: Option<Duration>,
}

impl SnapshotPolicy {
    /// Snapshot whenever the sequence number enters a new bucket of `k`.
    pub fn every_sequence_numbers(k: i64) -> Self {
        Self {
            every_sequence_numbers: k.max(1),
            every: None,
        }
    }

    /// Also snapshot when this much enqueued time passed since the last one.
    pub fn with_interval(mut self, every: Duration) -> Self {
        self.every = Some(every);
        self
    }

    pub fn should_snapshot(
        &self,
        last: Option<&MessagePosition>,
        current: &MessagePosition,
    ) -> bool {
        if last.is_some_and(|last| current.sequence_number <= last.sequence_number) {
            return false;
        }
        let last_sequence_number = last.map(|p| p.sequence_number).unwrap_or(0);

        let k = self.every_sequence_numbers;
        if current.sequence_number.div_euclid(k) > last_sequence_number.div_euclid(k) {
            return true;
        }

        match (self.every, last) {
            (Some(every), Some(last)) => (current.enqueued_time - last.enqueued_time)
                .to_std()
                .map(|elapsed| elapsed >= every)
                .unwrap_or(false),
            _ => false,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// A persisted state and the position it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord<S> {
    pub position: MessagePosition,
    pub state: S,
}

/// Snapshots of one state type in a blob store.
///
/// Keys are `{prefix}/{partition}/{sequence_number:020}.json`, so listing a
/// partition returns its snapshots in position order.
pub struct SnapshotStore<S> {
    blobs: Arc<dyn BlobStore>,
    prefix: String,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for SnapshotStore<S> {
    fn clone(&self) -> Self {
        Self {
            blobs: self.blobs.clone(),
            prefix: self.prefix.clone(),
            _state: PhantomData,
        }
    }
}

impl<S: AggregationState> SnapshotStore<S> {
    pub fn new(blobs: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            blobs,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            _state: PhantomData,
        }
    }

    fn partition_prefix(&self, partition_id: &PartitionId) -> String {
        if self.prefix.is_empty() {
            format!("{}/", partition_id)
        } else {
            format!("{}/{}/", self.prefix, partition_id)
        }
    }

    pub fn key(&self, partition_id: &PartitionId, sequence_number: SequenceNumber) -> String {
        format!(
            "{}{:020}{}",
            self.partition_prefix(partition_id),
            sequence_number,
            KEY_SUFFIX
        )
    }

    /// Persist a state under its last position.
    ///
    /// Returns `false` when a snapshot for that position already exists; the
    /// existing one is left untouched.
    pub async fn store(&self, state: &S) -> Result<bool> {
        let position = state
            .last_position()
            .cloned()
            .ok_or(SnapshotError::NoPosition)?;
        let key = self.key(&position.partition_id, position.sequence_number);
        let record = SnapshotRecord {
            position,
            state: state.clone(),
        };
        let data = serde_json::to_vec(&record)?;
        Ok(self.blobs.put_if_absent(&key, Bytes::from(data)).await?)
    }

    /// Sequence numbers of the stored snapshots of a partition, ascending.
    pub async fn positions(&self, partition_id: &PartitionId) -> Result<Vec<SequenceNumber>> {
        let prefix = self.partition_prefix(partition_id);
        let names = self.blobs.list(&prefix).await?;
        let mut positions: Vec<SequenceNumber> = names
            .iter()
            .filter_map(|name| {
                let parsed = name
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(KEY_SUFFIX))
                    .and_then(|digits| digits.parse::<SequenceNumber>().ok());
                if parsed.is_none() {
                    warn!(key = %name, "Ignoring unrecognized snapshot key");
                }
                parsed
            })
            .collect();
        positions.sort_unstable();
        Ok(positions)
    }

    /// Most recent snapshot at or below `upper_bound`, if any.
    pub async fn load_latest(
        &self,
        partition_id: &PartitionId,
        upper_bound: Option<SequenceNumber>,
    ) -> Result<Option<SnapshotRecord<S>>> {
        let positions = self.positions(partition_id).await?;
        let Some(sequence_number) = positions
            .into_iter()
            .rev()
            .find(|n| upper_bound.map_or(true, |bound| *n <= bound))
        else {
            return Ok(None);
        };

        let key = self.key(partition_id, sequence_number);
        let Some(data) = self.blobs.get(&key).await? else {
            return Ok(None);
        };
        let record: SnapshotRecord<S> = serde_json::from_slice(&data)?;
        debug!(
            partition_id = %partition_id,
            sequence_number = record.position.sequence_number,
            "Loaded snapshot"
        );
        Ok(Some(record))
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Snapshot stage of a partition chain.
///
/// Consumes the fold's state stream, applies the policy and hands due states
/// to a writer task through a queue of `max_pending_writes`. A full queue
/// skips the state without advancing the last snapshot position, so the next
/// state is considered again.
pub struct SnapshotScheduler<S> {
    partition_id: PartitionId,
    policy: SnapshotPolicy,
    store: SnapshotStore<S>,
    max_pending_writes: usize,
    last_snapshot: Option<MessagePosition>,
}

impl<S: AggregationState> SnapshotScheduler<S> {
    pub fn new(
        partition_id: PartitionId,
        policy: SnapshotPolicy,
        store: SnapshotStore<S>,
        max_pending_writes: usize,
    ) -> Self {
        Self {
            partition_id,
            policy,
            store,
            max_pending_writes: max_pending_writes.max(1),
            last_snapshot: None,
        }
    }

    /// Seed with the position of the snapshot the partition resumed from.
    pub fn with_last_snapshot(mut self, position: Option<MessagePosition>) -> Self {
        self.last_snapshot = position;
        self
    }

    /// Run until the state stream ends or `cancel` fires.
    ///
    /// On a closed input, queued writes are finished before returning. On
    /// cancellation, queued writes are dropped. Returns the position of the
    /// last snapshot handed to the writer.
    pub async fn run(
        mut self,
        mut states: mpsc::Receiver<Arc<S>>,
        cancel: CancellationToken,
    ) -> Option<MessagePosition> {
        let (writes, pending) = mpsc::channel(self.max_pending_writes);
        let writer = tokio::spawn(write_snapshots(
            self.partition_id.clone(),
            self.store.clone(),
            pending,
            cancel.clone(),
        ));

        loop {
            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(partition_id = %self.partition_id, "Snapshot stage cancelled");
                    break;
                }
                state = states.recv() => match state {
                    Some(state) => state,
                    None => break,
                },
            };

            let Some(position) = state.last_position().cloned() else {
                continue;
            };
            if !self
                .policy
                .should_snapshot(self.last_snapshot.as_ref(), &position)
            {
                continue;
            }

            match writes.try_send(state) {
                Ok(()) => self.last_snapshot = Some(position),
                Err(TrySendError::Full(_)) => {
                    debug!(
                        partition_id = %self.partition_id,
                        sequence_number = position.sequence_number,
                        "Snapshot writer busy, deferring snapshot"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(partition_id = %self.partition_id, "Snapshot writer stopped");
                    break;
                }
            }
        }

        drop(writes);
        if let Err(e) = writer.await {
            warn!(partition_id = %self.partition_id, error = %e, "Snapshot writer task failed");
        }
        self.last_snapshot
    }
}

async fn write_snapshots<S: AggregationState>(
    partition_id: PartitionId,
    store: SnapshotStore<S>,
    mut pending: mpsc::Receiver<Arc<S>>,
    cancel: CancellationToken,
) {
    loop {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            state = pending.recv() => match state {
                Some(state) => state,
                None => break,
            },
        };

        let sequence_number = state.last_position().map(|p| p.sequence_number);
        match store.store(&state).await {
            Ok(true) => info!(partition_id = %partition_id, sequence_number, "Snapshot written"),
            Ok(false) => debug!(partition_id = %partition_id, sequence_number, "Snapshot already exists"),
            Err(e) => warn!(
                partition_id = %partition_id,
                sequence_number,
                error = %e,
                "Failed to write snapshot"
            ),
        }
    }
}

#[cfg(test)]
mod tests;
