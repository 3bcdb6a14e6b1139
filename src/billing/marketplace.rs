//! Batch usage HTTP client.
//!
//! Posts `{"request": [...]}` to `/api/batchUsageEvent` and maps the
//! per-record `result` entries back onto the submitted records.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{
    BillingApi, BillingError, ResourceId, Result, SubmissionOutcome, SubmissionResult, UsageRecord,
    MAX_BATCH_SIZE,
};
use crate::config::BillingConfig;
use crate::utils::retry::http_backoff;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageEventRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_uri: Option<&'a str>,
    quantity: f64,
    dimension: &'a str,
    effective_start_time: String,
    plan_id: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchUsageRequest<'a> {
    request: Vec<UsageEventRequest<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageEventResult {
    usage_event_id: Option<String>,
    status: String,
    resource_id: Option<String>,
    resource_uri: Option<String>,
    dimension: String,
    effective_start_time: DateTime<Utc>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchUsageResponse {
    result: Vec<UsageEventResult>,
}

fn to_request(record: &UsageRecord) -> UsageEventRequest<'_> {
    let (resource_id, resource_uri) = match &record.resource {
        ResourceId::SaasSubscription(id) => (Some(id.as_str()), None),
        ResourceId::ManagedApp(uri) => (None, Some(uri.as_str())),
    };
    UsageEventRequest {
        resource_id,
        resource_uri,
        quantity: record.quantity,
        dimension: &record.dimension,
        effective_start_time: record
            .effective_start_time
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        plan_id: &record.plan_id,
    }
}

fn to_outcome(result: &UsageEventResult) -> SubmissionOutcome {
    match result.status.as_str() {
        "Accepted" => SubmissionOutcome::Accepted {
            usage_event_id: result.usage_event_id.clone().unwrap_or_default(),
        },
        "Duplicate" => SubmissionOutcome::Duplicate,
        status => {
            let (code, message) = match &result.error {
                Some(e) => (e.code.clone(), e.message.clone()),
                None => (None, None),
            };
            SubmissionOutcome::Rejected {
                code: code.unwrap_or_else(|| status.to_string()),
                message: message.unwrap_or_default(),
            }
        }
    }
}

/// Pair each response entry with the submitted record it answers.
fn match_results(batch: &[UsageRecord], response: BatchUsageResponse) -> Vec<SubmissionResult> {
    response
        .result
        .iter()
        .filter_map(|result| {
            let resource = result
                .resource_id
                .as_deref()
                .or(result.resource_uri.as_deref())
                .unwrap_or_default();
            let record = batch.iter().find(|r| {
                r.resource.as_str() == resource
                    && r.dimension == result.dimension
                    && r.effective_start_time == result.effective_start_time
            });
            match record {
                Some(record) => Some(SubmissionResult {
                    record: record.clone(),
                    outcome: to_outcome(result),
                }),
                None => {
                    warn!(resource = %resource, dimension = %result.dimension, "Billing API returned a result for an unknown record");
                    None
                }
            }
        })
        .collect()
}

/// Client of the batch usage API.
pub struct MarketplaceClient {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl MarketplaceClient {
    pub fn new(config: &BillingConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(BillingError::Config("billing endpoint not configured".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{}/api/batchUsageEvent?api-version={}",
                config.endpoint.trim_end_matches('/'),
                config.api_version
            ),
            bearer_token: config.bearer_token.clone(),
        })
    }

    fn backoff() -> ExponentialBuilder {
        http_backoff()
    }

    /// Timeouts and connection failures are worth an immediate retry.
    fn is_retryable(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }

    /// Throttling, server errors and credential failures leave the batch
    /// queued for the next poll; anything else is a bad request.
    fn is_transient_status(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status.is_server_error()
    }

    async fn post_batch(&self, batch: &[UsageRecord]) -> Result<Vec<SubmissionResult>> {
        let body = BatchUsageRequest {
            request: batch.iter().map(to_request).collect(),
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            let parsed: BatchUsageResponse = serde_json::from_str(&text)?;
            debug!(records = batch.len(), results = parsed.result.len(), "Usage batch posted");
            return Ok(match_results(batch, parsed));
        }

        let detail = format!("HTTP {} - {}", status, text.chars().take(200).collect::<String>());
        if Self::is_transient_status(status) {
            warn!(status = %status, body = %text, "Usage batch POST returned retryable status");
            Err(BillingError::Transient(detail))
        } else {
            error!(status = %status, body = %text, "Usage batch POST failed");
            Err(BillingError::InvalidRequest(detail))
        }
    }
}

#[async_trait]
impl BillingApi for MarketplaceClient {
    async fn submit(&self, batch: &[UsageRecord]) -> Result<Vec<SubmissionResult>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(BillingError::InvalidRequest(format!(
                "batch of {} exceeds the limit of {}",
                batch.len(),
                MAX_BATCH_SIZE
            )));
        }

        (|| async { self.post_batch(batch).await })
            .retry(Self::backoff())
            .when(|e| matches!(e, BillingError::Http(err) if Self::is_retryable(err)))
            .await
    }
}
