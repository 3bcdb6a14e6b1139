//! In-memory billing API for testing.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BillingApi, BillingError, Result, SubmissionOutcome, SubmissionResult, UsageRecord};

/// Scripted reply for the next call.
#[derive(Debug, Clone)]
enum Reply {
    Transient(String),
    Invalid(String),
}

/// Billing API that records every batch and accepts everything unless
/// scripted otherwise. Records already accepted are reported as duplicates.
#[derive(Default)]
pub struct RecordingBillingApi {
    calls: RwLock<Vec<Vec<UsageRecord>>>,
    accepted: RwLock<Vec<UsageRecord>>,
    script: RwLock<VecDeque<Reply>>,
}

impl RecordingBillingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls with a transient error.
    pub async fn fail_next(&self, times: usize) {
        let mut script = self.script.write().await;
        for _ in 0..times {
            script.push_back(Reply::Transient("service unavailable".to_string()));
        }
    }

    /// Reject the next call as an invalid request.
    pub async fn reject_next(&self, reason: impl Into<String>) {
        self.script.write().await.push_back(Reply::Invalid(reason.into()));
    }

    /// Every batch received, including failed calls.
    pub async fn calls(&self) -> Vec<Vec<UsageRecord>> {
        self.calls.read().await.clone()
    }

    /// Records accepted at least once.
    pub async fn accepted(&self) -> Vec<UsageRecord> {
        self.accepted.read().await.clone()
    }
}

#[async_trait]
impl BillingApi for RecordingBillingApi {
    async fn submit(&self, batch: &[UsageRecord]) -> Result<Vec<SubmissionResult>> {
        self.calls.write().await.push(batch.to_vec());

        if let Some(reply) = self.script.write().await.pop_front() {
            return Err(match reply {
                Reply::Transient(reason) => BillingError::Transient(reason),
                Reply::Invalid(reason) => BillingError::InvalidRequest(reason),
            });
        }

        let mut accepted = self.accepted.write().await;
        let results = batch
            .iter()
            .map(|record| {
                let key = record.key();
                let outcome = if accepted.iter().any(|r| r.key() == key) {
                    SubmissionOutcome::Duplicate
                } else {
                    accepted.push(record.clone());
                    SubmissionOutcome::Accepted {
                        usage_event_id: Uuid::new_v4().to_string(),
                    }
                };
                SubmissionResult {
                    record: record.clone(),
                    outcome,
                }
            })
            .collect();
        Ok(results)
    }
}
