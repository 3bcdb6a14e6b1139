//! Billing API and submission configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::billing::MAX_BATCH_SIZE;

/// Default billing API endpoint.
pub const DEFAULT_BILLING_ENDPOINT: &str = "https://marketplaceapi.microsoft.com";

/// Default billing API version.
pub const DEFAULT_BILLING_API_VERSION: &str = "2018-08-31";

/// Billing API client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Base URL of the billing API.
    pub endpoint: String,
    pub api_version: String,
    /// Bearer token sent with every request. Usually set through
    /// `METERING__SUBMISSION__BILLING__BEARER_TOKEN`.
    pub bearer_token: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_BILLING_ENDPOINT.to_string(),
            api_version: DEFAULT_BILLING_API_VERSION.to_string(),
            bearer_token: None,
            timeout_secs: 30,
        }
    }
}

impl BillingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Usage submission configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Maximum records per billing API call. Capped at 25.
    pub batch_size: usize,
    /// Delay between two submission attempts.
    pub poll_interval_ms: u64,
    pub billing: BillingConfig,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            poll_interval_ms: 1_000,
            billing: BillingConfig::default(),
        }
    }
}

impl SubmissionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
