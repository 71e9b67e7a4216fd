//! Bounded retry for store calls.
//!
//! Only transport-level failures are retried. A definitive answer from the
//! store (stale token, conflict, missing run) comes back on the first try.
//! A `Retry-After` hint from a 429 replaces the computed backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info_span, warn, Instrument};

use crate::error::StoreResult;
use crate::metrics::record_retry;

/// Backoff settings shared by every store call site.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Ceiling for a single sleep, hints excluded.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// `RUN_STORE_RETRIES`, `RUN_STORE_RETRY_BASE_MS`, `RUN_STORE_RETRY_MAX_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(fallback)
        };

        Self {
            max_retries: u32::try_from(read("RUN_STORE_RETRIES", u64::from(defaults.max_retries)))
                .unwrap_or(defaults.max_retries),
            base_delay_ms: read("RUN_STORE_RETRY_BASE_MS", defaults.base_delay_ms),
            max_delay_ms: read("RUN_STORE_RETRY_MAX_MS", defaults.max_delay_ms),
        }
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sleep before retry number `retry` (0-based).
    ///
    /// Full jitter over `base * 2^retry`, capped at `max_delay_ms` and never
    /// below `base_delay_ms`. A server hint replaces the jitter but is held
    /// to the same cap.
    pub fn backoff(&self, retry: u32, hint_ms: Option<u64>) -> Duration {
        if let Some(hint) = hint_ms {
            return Duration::from_millis(hint.min(self.max_delay_ms));
        }

        let ceiling = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX))
            .min(self.max_delay_ms);
        let floor = self.base_delay_ms.min(ceiling);
        let picked = if ceiling > floor {
            rand::rng().random_range(floor..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(picked)
    }
}

/// Run `op` until it succeeds, fails definitively, or retries run out.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut retry = 0u32;
    loop {
        let span = info_span!("run_store_call", operation = %operation, attempt = retry + 1);
        let err = match op().instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if retry >= config.max_retries {
            if config.max_retries > 0 {
                warn!(operation = %operation, attempts = retry + 1, "Giving up on run store call: {}", err);
            }
            return Err(err);
        }

        let delay = config.backoff(retry, err.retry_after_ms());
        warn!(
            operation = %operation,
            attempt = retry + 1,
            delay_ms = delay.as_millis() as u64,
            "Run store call failed, retrying: {}",
            err
        );
        record_retry(operation);
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}
