//! Exclusive acquisition and release of runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use leasehold_models::{ClaimRequest, LeaseToken, LockToken, ReleaseRequest, Run, WorkerId};
use leasehold_store::{with_retry, RetryConfig, RunStore, StoreError, StoreResult};

use crate::metrics::record_claim;

/// Run a store call under `timeout`. An elapsed timer is a transport error.
pub(crate) async fn bounded_call<T, F>(timeout: Duration, operation: &str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(format!(
            "{} exceeded {}ms",
            operation,
            timeout.as_millis()
        ))),
    }
}

/// Claims runs for one worker and gives them back.
pub struct RunClaimer {
    store: Arc<dyn RunStore>,
    lease_minutes: u32,
    task_type: Option<String>,
    rpc_timeout: Duration,
    retry: RetryConfig,
}

impl RunClaimer {
    pub fn new(
        store: Arc<dyn RunStore>,
        lease_minutes: u32,
        task_type: Option<String>,
        rpc_timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            lease_minutes,
            task_type,
            rpc_timeout,
            retry,
        }
    }

    /// Claim the next run for `worker_id`.
    ///
    /// The store answers recovery-first: a run this worker already owns is
    /// handed back under the fresh token before any unclaimed work. Retrying
    /// with the same token is therefore safe. Returns `None` when there is no
    /// work and also when the store cannot be reached.
    pub async fn claim_next(&self, worker_id: &WorkerId) -> Option<Run> {
        let lock_token = LockToken::generate();
        let req = ClaimRequest {
            worker_id: worker_id.clone(),
            lock_token: lock_token.clone(),
            lease_minutes: self.lease_minutes,
            task_type: self.task_type.clone(),
        };

        let result = with_retry(&self.retry, "claim_next", || {
            bounded_call(self.rpc_timeout, "claim_next", self.store.claim_next(&req))
        })
        .await;

        match result {
            Ok(Some(run_id)) => {
                info!(run_id = %run_id, worker_id = %worker_id, "Claimed run");
                record_claim();
                let mut run = Run::claimed(run_id, worker_id.clone(), lock_token, self.lease_minutes);
                run.task_type = self.task_type.clone();
                Some(run)
            }
            Ok(None) => {
                debug!(worker_id = %worker_id, "No run available");
                None
            }
            Err(e) => {
                warn!(worker_id = %worker_id, "Claim failed, treating as no work: {}", e);
                None
            }
        }
    }

    /// Give up the lease. `false` when the token no longer matches or the
    /// store could not be reached.
    pub async fn release(&self, lease: &LeaseToken, worker_id: &WorkerId) -> bool {
        let req = ReleaseRequest {
            run_id: lease.run_id.clone(),
            worker_id: worker_id.clone(),
            lock_token: lease.lock_token.clone(),
        };

        let result = with_retry(&self.retry, "release", || {
            bounded_call(self.rpc_timeout, "release", self.store.release(&req))
        })
        .await;

        match result {
            Ok(true) => {
                debug!(run_id = %lease.run_id, "Released run");
                true
            }
            Ok(false) => {
                warn!(run_id = %lease.run_id, "Release refused: lock token no longer matches");
                false
            }
            Err(e) => {
                warn!(run_id = %lease.run_id, "Release failed: {}", e);
                false
            }
        }
    }
}
