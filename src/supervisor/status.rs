//! Cross-partition status reporting.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::{PartitionId, SequenceNumber};
use crate::pipeline::PipelineState;

/// Last reported status of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub state: PipelineState,
    pub last_sequence_number: Option<SequenceNumber>,
    pub restarts: u32,
}

/// Shared map of partition statuses, for diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct PartitionStatusTable {
    partitions: Arc<RwLock<BTreeMap<PartitionId, PartitionStatus>>>,
}

impl PartitionStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state change. A `None` position keeps the previous one.
    pub async fn update(
        &self,
        partition_id: &PartitionId,
        state: PipelineState,
        last_sequence_number: Option<SequenceNumber>,
    ) {
        let mut partitions = self.partitions.write().await;
        let status = partitions
            .entry(partition_id.clone())
            .or_insert(PartitionStatus {
                state,
                last_sequence_number: None,
                restarts: 0,
            });
        status.state = state;
        if last_sequence_number.is_some() {
            status.last_sequence_number = last_sequence_number;
        }
    }

    pub async fn record_restart(&self, partition_id: &PartitionId) {
        if let Some(status) = self.partitions.write().await.get_mut(partition_id) {
            status.restarts += 1;
        }
    }

    pub async fn get(&self, partition_id: &PartitionId) -> Option<PartitionStatus> {
        self.partitions.read().await.get(partition_id).cloned()
    }

    pub async fn all(&self) -> BTreeMap<PartitionId, PartitionStatus> {
        self.partitions.read().await.clone()
    }

    /// Compact owned-partitions line: active partitions by id, others as `_`.
    ///
    /// Partitions `0..4` with `1` closed render as `0-_-2-3`.
    pub async fn render(&self) -> String {
        let partitions = self.partitions.read().await;
        let mut entries: Vec<(&PartitionId, &PartitionStatus)> = partitions.iter().collect();
        entries.sort_by_key(|(id, _)| (id.index().unwrap_or(usize::MAX), id.as_str().to_string()));
        entries
            .into_iter()
            .map(|(id, status)| {
                if status.state.is_active() {
                    id.to_string()
                } else {
                    "_".to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("-")
    }
}
