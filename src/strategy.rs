//! HTTP client for the downstream strategy computation.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::error::StrategyError;
use crate::types::CombinedPayload;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that turns a combined payload into strategy text.
///
/// One attempt per call; retries, if ever added, belong behind this trait so
/// the aggregator's ingest path never waits on them.
pub trait Strategy: Send + Sync + 'static {
    fn compute(
        &self,
        payload: CombinedPayload,
    ) -> impl Future<Output = Result<String, StrategyError>> + Send;
}

#[derive(Deserialize)]
struct StrategyResponse {
    strategy: String,
}

/// POSTs `{overtake_data, tire_data, pit_data}` and reads `{strategy}`.
#[derive(Clone)]
pub struct StrategyClient {
    url: String,
    client: reqwest::Client,
}

impl StrategyClient {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }

    #[must_use]
    pub fn with_default_timeout(url: impl Into<String>) -> Self {
        Self::new(url, DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Strategy for StrategyClient {
    async fn compute(&self, payload: CombinedPayload) -> Result<String, StrategyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(StrategyError::Unreachable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(StrategyError::Status(status));
        }

        let body = response.bytes().await.map_err(StrategyError::Unreachable)?;
        let parsed: StrategyResponse = serde_json::from_slice(&body)
            .map_err(|e| StrategyError::Decode(e.to_string()))?;
        Ok(parsed.strategy)
    }
}
