//! Metered billing state.
//!
//! [`MeterCollection`] is the aggregation state of one partition: a meter
//! per subscription routed to that partition, plus bookkeeping for records
//! the fold could not use. The fold clock is the enqueued time of each
//! record; moving into a later hour closes the previous hour's overage into
//! usage records that wait for submission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::billing::{SubmissionOutcome, SubmissionResult, UsageRecord};
use crate::fold::AggregationState;
use crate::model::{MessagePosition, ObservedRecord, PartitionId};

pub mod event;
pub mod meter;

pub use event::{
    BillingDimension, MeteringEvent, Ping, PingReason, Plan, RenewalInterval, SubscriptionDeleted,
    SubscriptionPurchased, UsageReported, UsageSubmitted,
};
pub use meter::{DimensionConsumption, Meter};

/// Bookkeeping lists keep only this many most recent entries.
pub const MAX_TRACKED: usize = 100;

/// A record the fold could not use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unprocessable {
    pub position: MessagePosition,
    pub reason: String,
}

/// Aggregation state of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterCollection {
    pub partition_id: PartitionId,
    /// Keyed by resource id.
    pub meters: BTreeMap<String, Meter>,
    pub unprocessable: Vec<Unprocessable>,
    /// Submissions the billing API refused.
    pub rejected: Vec<SubmissionResult>,
    pub last_position: Option<MessagePosition>,
}

fn push_bounded<T>(list: &mut Vec<T>, item: T) {
    list.push(item);
    if list.len() > MAX_TRACKED {
        let excess = list.len() - MAX_TRACKED;
        list.drain(..excess);
    }
}

impl MeterCollection {
    pub fn meter(&self, resource_id: &str) -> Option<&Meter> {
        self.meters.get(resource_id)
    }

    fn unprocessable(&mut self, position: &MessagePosition, reason: String) {
        push_bounded(
            &mut self.unprocessable,
            Unprocessable {
                position: position.clone(),
                reason,
            },
        );
    }

    fn handle(&mut self, event: MeteringEvent, record: &ObservedRecord, position: &MessagePosition) {
        let now = record.record.enqueued_time;
        match event {
            MeteringEvent::SubscriptionPurchased(purchase) => {
                let key = purchase.resource.as_str().to_string();
                match self.meters.get(&key) {
                    Some(existing) if !existing.deleted => {
                        self.unprocessable(position, format!("subscription {} already exists", key));
                    }
                    _ => {
                        let mut meter = Meter::new(&purchase, now);
                        if let Some(previous) = self.meters.remove(&key) {
                            meter.usage_to_be_reported = previous.usage_to_be_reported;
                        }
                        self.meters.insert(key, meter);
                    }
                }
            }
            MeteringEvent::SubscriptionDeleted(deleted) => {
                match self.meters.get_mut(deleted.resource.as_str()) {
                    Some(meter) => meter.delete(),
                    None => self.unprocessable(
                        position,
                        format!("unknown subscription {}", deleted.resource),
                    ),
                }
            }
            MeteringEvent::UsageReported(usage) => {
                let outcome = match self.meters.get_mut(usage.resource.as_str()) {
                    Some(meter) if !meter.deleted => meter.consume(&usage.meter_name, usage.quantity),
                    Some(_) => Err(format!("subscription {} was deleted", usage.resource)),
                    None => Err(format!("unknown subscription {}", usage.resource)),
                };
                if let Err(reason) = outcome {
                    self.unprocessable(position, reason);
                }
            }
            MeteringEvent::UsageSubmitted(submitted) => {
                for result in submitted.results {
                    if let Some(meter) = self.meters.get_mut(result.record.resource.as_str()) {
                        meter.settle(&result.record.key());
                    }
                    if matches!(result.outcome, SubmissionOutcome::Rejected { .. }) {
                        push_bounded(&mut self.rejected, result);
                    }
                }
            }
            // The clock already moved.
            MeteringEvent::Ping(_) => {}
        }
    }
}

impl AggregationState for MeterCollection {
    fn empty(partition_id: &PartitionId) -> Self {
        Self {
            partition_id: partition_id.clone(),
            meters: BTreeMap::new(),
            unprocessable: Vec::new(),
            rejected: Vec::new(),
            last_position: None,
        }
    }

    fn apply(mut self, record: &ObservedRecord) -> Self {
        let position = record.position();

        for meter in self.meters.values_mut() {
            meter.advance_to(record.record.enqueued_time);
        }

        match MeteringEvent::decode(&record.record.body) {
            Ok(event) => self.handle(event, record, &position),
            Err(e) => self.unprocessable(&position, format!("undecodable body: {}", e)),
        }

        self.meters
            .retain(|_, meter| !(meter.deleted && meter.usage_to_be_reported.is_empty()));
        self.last_position = Some(position);
        self
    }

    fn pending_usage(&self) -> Vec<UsageRecord> {
        self.meters
            .values()
            .flat_map(|meter| meter.usage_to_be_reported.iter().cloned())
            .collect()
    }

    fn last_position(&self) -> Option<&MessagePosition> {
        self.last_position.as_ref()
    }
}
