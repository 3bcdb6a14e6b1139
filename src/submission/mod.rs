//! Usage submission stage.
//!
//! Consumes a partition's state stream, enqueues usage records that newly
//! appear in the pending projection, submits them in batches and writes the
//! billing API's verdicts back into the partition as `usage_submitted`
//! events. Once the fold applies that acknowledgement, the records leave the
//! pending projection.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::billing::{BillingApi, ResourceKind, UsageRecord, UsageRecordKey, MAX_BATCH_SIZE};
use crate::bus::LiveLog;
use crate::fold::AggregationState;
use crate::metering::{MeteringEvent, UsageSubmitted};
use crate::model::PartitionId;

/// Default delay between two submission attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Deduplication and batching
// ============================================================================

/// Remembers the previous pending projection of a partition.
#[derive(Debug, Default)]
pub struct PendingUsageTracker {
    previous: HashSet<UsageRecordKey>,
}

impl PendingUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of `pending` absent from the previous projection, in order.
    /// `pending` becomes the previous projection.
    pub fn observe(&mut self, pending: &[UsageRecord]) -> Vec<UsageRecord> {
        let fresh = pending
            .iter()
            .filter(|record| !self.previous.contains(&record.key()))
            .cloned()
            .collect();
        self.previous = pending.iter().map(UsageRecord::key).collect();
        fresh
    }
}

/// Records submitted together in one billing API call.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageBatch {
    pub partition_id: PartitionId,
    pub records: Vec<UsageRecord>,
}

/// Group records by batch key, in order of first appearance, and chunk each
/// group to at most `batch_size` records (never above [`MAX_BATCH_SIZE`]).
pub fn into_batches(
    partition_id: &PartitionId,
    records: Vec<UsageRecord>,
    batch_size: usize,
) -> Vec<UsageBatch> {
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);

    let mut groups: Vec<(ResourceKind, Vec<UsageRecord>)> = Vec::new();
    for record in records {
        let key = record.batch_key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(record),
            None => groups.push((key, vec![record])),
        }
    }

    groups
        .into_iter()
        .flat_map(|(_, group)| {
            group
                .chunks(batch_size)
                .map(|chunk| UsageBatch {
                    partition_id: partition_id.clone(),
                    records: chunk.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

// ============================================================================
// Stage
// ============================================================================

/// Counters of one submission stage run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    pub enqueued_batches: usize,
    pub submitted_batches: usize,
    pub dropped_batches: usize,
    pub failed_attempts: usize,
}

/// What to do with the batch at the head of the queue.
enum Verdict {
    Done,
    Dropped,
    Retry,
}

type BatchQueue = Arc<Mutex<VecDeque<UsageBatch>>>;

/// Submission stage of a partition chain.
pub struct UsageSubmissionPipeline {
    partition_id: PartitionId,
    api: Arc<dyn BillingApi>,
    log: Arc<dyn LiveLog>,
    batch_size: usize,
    poll_interval: Duration,
}

impl UsageSubmissionPipeline {
    pub fn new(partition_id: PartitionId, api: Arc<dyn BillingApi>, log: Arc<dyn LiveLog>) -> Self {
        Self {
            partition_id,
            api,
            log,
            batch_size: MAX_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until `cancel` fires, or until the state stream has ended and
    /// every queued batch was settled.
    pub async fn run<S: AggregationState>(
        self,
        states: mpsc::Receiver<Arc<S>>,
        cancel: CancellationToken,
    ) -> SubmissionStats {
        let queue: BatchQueue = Arc::new(Mutex::new(VecDeque::new()));
        let intake = tokio::spawn(enqueue_pending(
            self.partition_id.clone(),
            states,
            queue.clone(),
            self.batch_size,
            cancel.clone(),
        ));

        let mut stats = SubmissionStats::default();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let intake_finished = intake.is_finished();
            let head = queue.lock().await.front().cloned();
            let Some(batch) = head else {
                if intake_finished {
                    break;
                }
                continue;
            };

            match self.submit(&batch).await {
                Verdict::Done => {
                    queue.lock().await.pop_front();
                    stats.submitted_batches += 1;
                }
                Verdict::Dropped => {
                    queue.lock().await.pop_front();
                    stats.dropped_batches += 1;
                }
                Verdict::Retry => stats.failed_attempts += 1,
            }
        }

        match intake.await {
            Ok(enqueued) => stats.enqueued_batches = enqueued,
            Err(e) => warn!(partition_id = %self.partition_id, error = %e, "Submission intake task failed"),
        }
        let abandoned = queue.lock().await.len();
        info!(
            partition_id = %self.partition_id,
            submitted = stats.submitted_batches,
            dropped = stats.dropped_batches,
            abandoned,
            "Submission stage stopped"
        );
        stats
    }

    async fn submit(&self, batch: &UsageBatch) -> Verdict {
        let records = batch.records.len();
        let results = match self.api.submit(&batch.records).await {
            Ok(results) => results,
            Err(e) if e.is_unrecoverable() => {
                error!(
                    partition_id = %self.partition_id,
                    records,
                    error = %e,
                    "Billing API rejected batch, dropping it"
                );
                return Verdict::Dropped;
            }
            Err(e) => {
                warn!(partition_id = %self.partition_id, records, error = %e, "Batch submission failed, will retry");
                return Verdict::Retry;
            }
        };

        let acknowledgement = MeteringEvent::UsageSubmitted(UsageSubmitted { results });
        let message = match acknowledgement.to_message() {
            Ok(message) => message,
            Err(e) => {
                error!(partition_id = %self.partition_id, error = %e, "Failed to encode submission acknowledgement");
                return Verdict::Dropped;
            }
        };
        match self.log.append(&self.partition_id, message).await {
            Ok(sequence_number) => {
                debug!(partition_id = %self.partition_id, records, sequence_number, "Batch submitted and acknowledged");
                Verdict::Done
            }
            Err(e) => {
                warn!(partition_id = %self.partition_id, records, error = %e, "Failed to append acknowledgement, will resubmit");
                Verdict::Retry
            }
        }
    }
}

/// Intake task: turn each state's new pending records into queued batches.
/// Returns the number of batches enqueued.
async fn enqueue_pending<S: AggregationState>(
    partition_id: PartitionId,
    mut states: mpsc::Receiver<Arc<S>>,
    queue: BatchQueue,
    batch_size: usize,
    cancel: CancellationToken,
) -> usize {
    let mut tracker = PendingUsageTracker::new();
    let mut enqueued = 0;

    loop {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            state = states.recv() => match state {
                Some(state) => state,
                None => break,
            },
        };

        let fresh = tracker.observe(&state.pending_usage());
        if fresh.is_empty() {
            continue;
        }
        let batches = into_batches(&partition_id, fresh, batch_size);
        debug!(partition_id = %partition_id, batches = batches.len(), "Enqueueing usage batches");
        enqueued += batches.len();
        queue.lock().await.extend(batches);
    }

    enqueued
}
