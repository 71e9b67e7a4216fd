//! HTTP client for an RPC-style run store.
//!
//! - HTTP client tuning (pooling, timeouts)
//! - RPC calls posted as JSON parameter objects
//! - Observability (tracing spans, metrics)
//!
//! Methods make a single attempt. Callers decide whether to wrap them in
//! [`crate::retry::with_retry`]: the heartbeat, for instance, counts each
//! transport failure itself.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info_span, Instrument};

use leasehold_models::{
    ClaimRequest, HeartbeatRequest, InsertOutcome, ReleaseRequest, RunEvent, RunId, RunPatch,
};

use crate::error::{StoreError, StoreResult};
use crate::metrics::{record_cas_rejected, record_request};
use crate::retry::RetryConfig;
use crate::store::RunStore;

// =============================================================================
// Configuration
// =============================================================================

/// Run store client configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL of the REST endpoint, e.g. `https://db.example.com/rest/v1`
    pub base_url: String,
    /// API key sent as `apikey` and bearer token
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration for callers that retry
    pub retry: RetryConfig,
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        let base_url = std::env::var("RUN_STORE_URL").map_err(|_| {
            StoreError::Config("RUN_STORE_URL must be set to reach the run store".to_string())
        })?;

        if base_url.trim().is_empty() {
            return Err(StoreError::Config("RUN_STORE_URL cannot be empty".to_string()));
        }

        let timeout_secs: u64 = std::env::var("RUN_STORE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let connect_timeout_secs: u64 = std::env::var("RUN_STORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: std::env::var("RUN_STORE_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Run store REST client.
#[derive(Clone)]
pub struct HttpRunStore {
    http: Client,
    config: StoreConfig,
}

impl HttpRunStore {
    /// Create a new run store client.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("leasehold-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StoreError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env()?)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rpc/{}", self.config.base_url, function)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    /// POST an RPC call and decode its JSON result.
    async fn call_rpc<B, T>(&self, function: &str, body: &B) -> StoreResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.rpc_url(function);
        let response = self
            .authorize(self.http.post(&url))
            .json(body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::handle_error_response(status, &url, response).await);
        }

        let text = response.text().await.map_err(map_send_error)?;
        serde_json::from_str(&text).map_err(|e| {
            let prefix: String = text.chars().take(200).collect();
            StoreError::InvalidResponse(format!(
                "{} returned unparseable body: {} (body prefix: {})",
                function, e, prefix
            ))
        })
    }

    /// Execute a request with tracing and metrics.
    async fn execute_request<T, F>(
        &self,
        operation: &str,
        run_id: Option<&RunId>,
        fut: F,
    ) -> StoreResult<T>
    where
        F: std::future::Future<Output = StoreResult<T>>,
    {
        let span = if let Some(id) = run_id {
            info_span!("run_store_request", operation = %operation, run_id = %id)
        } else {
            info_span!("run_store_request", operation = %operation)
        };

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn handle_error_response(status: StatusCode, url: &str, response: Response) -> StoreError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return StoreError::RateLimited(retry_after_ms);
        }
        let body = response.text().await.unwrap_or_default();
        StoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
    }
}

fn map_send_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::timeout(e.to_string())
    } else {
        StoreError::Network(e)
    }
}

#[async_trait]
impl RunStore for HttpRunStore {
    async fn claim_next(&self, req: &ClaimRequest) -> StoreResult<Option<RunId>> {
        self.execute_request("claim_next", None, async {
            let run_id: Option<String> = self.call_rpc("claim_next_run", req).await?;
            Ok(run_id.filter(|id| !id.is_empty()).map(RunId::from_string))
        })
        .await
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> StoreResult<bool> {
        let renewed = self
            .execute_request("heartbeat", Some(&req.run_id), async {
                self.call_rpc::<_, bool>("heartbeat_run", req).await
            })
            .await?;
        if !renewed {
            record_cas_rejected("heartbeat");
        }
        Ok(renewed)
    }

    async fn release(&self, req: &ReleaseRequest) -> StoreResult<bool> {
        let released = self
            .execute_request("release", Some(&req.run_id), async {
                self.call_rpc::<_, bool>("release_run", req).await
            })
            .await?;
        if !released {
            record_cas_rejected("release");
        }
        Ok(released)
    }

    async fn patch_run_status(&self, run_id: &RunId, patch: &RunPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let url = format!("{}/runs", self.config.base_url);

        self.execute_request("patch_run_status", Some(run_id), async {
            let response = self
                .authorize(self.http.patch(&url))
                .query(&[("id", format!("eq.{}", run_id))])
                .header("Prefer", "return=minimal")
                .json(patch)
                .send()
                .await
                .map_err(map_send_error)?;

            let status = response.status();
            if status.is_success() {
                debug!(run_id = %run_id, "Patched run");
                Ok(())
            } else {
                Err(Self::handle_error_response(status, &url, response).await)
            }
        })
        .await
    }

    async fn insert_event(&self, event: &RunEvent) -> StoreResult<InsertOutcome> {
        let url = format!("{}/run_events", self.config.base_url);

        self.execute_request("insert_event", Some(&event.run_id), async {
            let response = self
                .authorize(self.http.post(&url))
                .header("Prefer", "return=minimal")
                .json(event)
                .send()
                .await
                .map_err(map_send_error)?;

            match response.status() {
                status if status.is_success() => Ok(InsertOutcome::Inserted),
                StatusCode::CONFLICT => {
                    debug!(event_id = %event.event_id, "Event already recorded");
                    Ok(InsertOutcome::Duplicate)
                }
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_from_env_requires_url() {
        std::env::remove_var("RUN_STORE_URL");
        assert!(matches!(StoreConfig::from_env(), Err(StoreError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_config_default_values() {
        std::env::set_var("RUN_STORE_URL", "http://localhost:3000/rest/v1/");
        std::env::remove_var("RUN_STORE_TIMEOUT_SECS");
        std::env::remove_var("RUN_STORE_API_KEY");
        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.base_url, "http://localhost:3000/rest/v1");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.api_key.is_none());
        std::env::remove_var("RUN_STORE_URL");
    }
}
