//! Billing API collaborator.
//!
//! Usage is reported to the billing provider as [`UsageRecord`]s in batches
//! of at most [`MAX_BATCH_SIZE`]. The provider answers per record; see
//! [`SubmissionOutcome`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod marketplace;
pub mod mock;

pub use marketplace::MarketplaceClient;
pub use mock::RecordingBillingApi;

/// Largest batch the billing API accepts.
pub const MAX_BATCH_SIZE: usize = 25;

/// Billed resource. SaaS subscriptions and managed applications are
/// addressed differently by the billing API and cannot share a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceId {
    SaasSubscription(String),
    ManagedApp(String),
}

impl ResourceId {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceId::SaasSubscription(id) | ResourceId::ManagedApp(id) => id,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceId::SaasSubscription(_) => ResourceKind::SaasSubscription,
            ResourceId::ManagedApp(_) => ResourceKind::ManagedApp,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    SaasSubscription,
    ManagedApp,
}

/// One hour of overage for one dimension of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub resource: ResourceId,
    pub plan_id: String,
    pub dimension: String,
    pub quantity: f64,
    pub effective_start_time: DateTime<Utc>,
}

impl UsageRecord {
    /// Identity of the record. The billing API accepts one record per key.
    pub fn key(&self) -> UsageRecordKey {
        UsageRecordKey {
            resource: self.resource.clone(),
            dimension: self.dimension.clone(),
            effective_start_time: self.effective_start_time,
        }
    }

    pub fn batch_key(&self) -> ResourceKind {
        self.resource.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageRecordKey {
    pub resource: ResourceId,
    pub dimension: String,
    pub effective_start_time: DateTime<Utc>,
}

/// Provider verdict for one submitted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Accepted { usage_event_id: String },
    Duplicate,
    Rejected { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub record: UsageRecord,
    pub outcome: SubmissionOutcome,
}

/// Errors that can occur when calling the billing API.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Billing API unavailable: {0}")]
    Transient(String),

    /// The request can never succeed as sent.
    #[error("Billing API rejected the request: {0}")]
    InvalidRequest(String),

    #[error("Malformed billing API response: {0}")]
    Response(#[from] serde_json::Error),

    #[error("Billing client configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether resubmitting the same batch can never succeed.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, BillingError::InvalidRequest(_))
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;

/// Interface of the external billing API.
///
/// Implementations:
/// - `MarketplaceClient`: batch usage HTTP API
/// - `RecordingBillingApi`: in-memory recorder for tests
#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Submit one batch, returning a result per record.
    async fn submit(&self, batch: &[UsageRecord]) -> Result<Vec<SubmissionResult>>;
}
