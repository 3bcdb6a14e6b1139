//! Aggregation fold.
//!
//! Each partition's ordered event stream is folded into successive
//! aggregation states. The state type is supplied by the caller through
//! [`AggregationState`]; the engine only relies on the contract below.
//!
//! Folding from a snapshot's state over the records after the snapshot's
//! position must give the same state as folding the whole history from
//! [`AggregationState::empty`].

use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::billing::UsageRecord;
use crate::model::{MessagePosition, ObservedRecord, PartitionEvent, PartitionId};

/// Progress is logged every this many records.
const PROGRESS_INTERVAL: u64 = 100;

/// Contract between the engine and the aggregated state.
pub trait AggregationState:
    Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// State of a partition before any record.
    fn empty(partition_id: &PartitionId) -> Self;

    /// Advance by one record.
    ///
    /// Must not fail. Records that cannot be interpreted are recorded as
    /// unprocessable inside the state.
    fn apply(self, record: &ObservedRecord) -> Self;

    /// Usage records awaiting submission to the billing API.
    fn pending_usage(&self) -> Vec<UsageRecord>;

    /// Position of the last applied record.
    fn last_position(&self) -> Option<&MessagePosition>;
}

/// Scan accumulator: nothing yet, or a real state.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldState<S> {
    Uninitialized,
    Defined(S),
}

impl<S> FoldState<S> {
    pub fn defined(&self) -> Option<&S> {
        match self {
            FoldState::Defined(state) => Some(state),
            FoldState::Uninitialized => None,
        }
    }
}

/// Result of folding one event.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldStep<S> {
    pub state: FoldState<S>,
    /// Whether `state` is a new defined state to hand downstream.
    pub emit: bool,
}

/// Fold one partition event into the accumulator.
///
/// `Initializing` with a restored state replaces the accumulator; records
/// advance it (starting from the empty state when nothing was restored);
/// errors and closing notifications leave it unchanged.
pub fn fold<S: AggregationState>(state: FoldState<S>, event: &PartitionEvent<S>) -> FoldStep<S> {
    match event {
        PartitionEvent::Initializing {
            initial_state: Some(initial),
            ..
        } => FoldStep {
            state: FoldState::Defined(initial.clone()),
            emit: true,
        },
        PartitionEvent::Record(record) => {
            let current = match state {
                FoldState::Defined(current) => current,
                FoldState::Uninitialized => S::empty(&record.partition_id),
            };
            FoldStep {
                state: FoldState::Defined(current.apply(record)),
                emit: true,
            }
        }
        PartitionEvent::Initializing { .. }
        | PartitionEvent::Error { .. }
        | PartitionEvent::Closing { .. } => FoldStep { state, emit: false },
    }
}

/// Scan a sequence of events, returning every emitted state in order.
pub fn scan<'a, S, I>(events: I) -> Vec<S>
where
    S: AggregationState,
    I: IntoIterator<Item = &'a PartitionEvent<S>>,
{
    let mut emitted = Vec::new();
    let mut state = FoldState::Uninitialized;
    for event in events {
        let step = fold(state, event);
        if step.emit {
            if let Some(defined) = step.state.defined() {
                emitted.push(defined.clone());
            }
        }
        state = step.state;
    }
    emitted
}

/// Apply records onto a state.
pub fn fold_records<'a, S, I>(state: S, records: I) -> S
where
    S: AggregationState,
    I: IntoIterator<Item = &'a ObservedRecord>,
{
    records.into_iter().fold(state, |state, record| state.apply(record))
}

/// Fold stage of a partition chain.
///
/// Consumes the pipeline's events in order and sends each emitted state to
/// every output. Outputs that hang up are dropped; the stage ends when the
/// input closes or no outputs remain.
pub async fn run_fold<S: AggregationState>(
    partition_id: PartitionId,
    mut events: mpsc::Receiver<PartitionEvent<S>>,
    mut outputs: Vec<mpsc::Sender<Arc<S>>>,
) {
    let mut state = FoldState::Uninitialized;
    let mut records: u64 = 0;

    while let Some(event) = events.recv().await {
        match &event {
            PartitionEvent::Record(_) => {
                records += 1;
                if records % PROGRESS_INTERVAL == 0 {
                    debug!(partition_id = %partition_id, records, "Processed events");
                }
            }
            PartitionEvent::Initializing {
                starting_position, ..
            } => {
                info!(partition_id = %partition_id, starting_position = %starting_position, "Fold initializing");
            }
            PartitionEvent::Error { message, .. } => {
                warn!(partition_id = %partition_id, error = %message, "Partition reported an error");
            }
            PartitionEvent::Closing { reason, .. } => {
                info!(partition_id = %partition_id, reason = %reason, "Partition closing");
            }
        }

        let step = fold(state, &event);
        state = step.state;
        if !step.emit {
            continue;
        }
        let Some(current) = state.defined() else {
            continue;
        };

        let shared = Arc::new(current.clone());
        let mut open = Vec::with_capacity(outputs.len());
        for output in outputs.drain(..) {
            if output.send(shared.clone()).await.is_ok() {
                open.push(output);
            }
        }
        outputs = open;
        if outputs.is_empty() {
            debug!(partition_id = %partition_id, "All state consumers closed");
            break;
        }
    }

    debug!(partition_id = %partition_id, records, "Fold stage finished");
}
