//! Metering domain events carried in log record bodies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::billing::{ResourceId, SubmissionResult};
use crate::model::{OutgoingMessage, PartitionId};

/// Body of a metering log record: `{"type": ..., "value": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MeteringEvent {
    SubscriptionPurchased(SubscriptionPurchased),
    SubscriptionDeleted(SubscriptionDeleted),
    UsageReported(UsageReported),
    /// Written back by the submission pipeline once the billing API answered.
    UsageSubmitted(UsageSubmitted),
    /// Liveness marker written by the partition pipeline.
    Ping(Ping),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPurchased {
    pub resource: ResourceId,
    pub plan: Plan,
    pub subscription_start: DateTime<Utc>,
    #[serde(default)]
    pub renewal: RenewalInterval,
}

/// Billing plan: the dimensions a subscription is metered on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    /// Keyed by the meter name used in usage events.
    pub dimensions: BTreeMap<String, BillingDimension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingDimension {
    /// Dimension identifier known to the billing API.
    pub dimension_id: String,
    /// Quantity included per billing period before overage is billed.
    pub included_quantity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalInterval {
    #[default]
    Monthly,
    Annually,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDeleted {
    pub resource: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReported {
    pub resource: ResourceId,
    pub timestamp: DateTime<Utc>,
    pub meter_name: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSubmitted {
    pub results: Vec<SubmissionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub partition_id: PartitionId,
    pub reason: PingReason,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingReason {
    ProcessingStarting,
    TopOfHour,
}

impl MeteringEvent {
    pub fn decode(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Key that routes the event to its subscription's partition.
    pub fn partition_key(&self) -> Option<&str> {
        match self {
            MeteringEvent::SubscriptionPurchased(e) => Some(e.resource.as_str()),
            MeteringEvent::SubscriptionDeleted(e) => Some(e.resource.as_str()),
            MeteringEvent::UsageReported(e) => Some(e.resource.as_str()),
            MeteringEvent::UsageSubmitted(e) => e.results.first().map(|r| r.record.resource.as_str()),
            MeteringEvent::Ping(_) => None,
        }
    }

    pub fn to_message(&self) -> serde_json::Result<OutgoingMessage> {
        let message = OutgoingMessage::new(serde_json::to_vec(self)?);
        Ok(match self.partition_key() {
            Some(key) => message.with_partition_key(key),
            None => message,
        })
    }

    pub fn ping(partition_id: &PartitionId, reason: PingReason, sent_at: DateTime<Utc>) -> Self {
        MeteringEvent::Ping(Ping {
            partition_id: partition_id.clone(),
            reason,
            sent_at,
        })
    }
}
