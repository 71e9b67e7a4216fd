//! Background lease renewal for the run in hand.
//!
//! One task per claimed run sends CAS renewals on a jittered interval and
//! publishes the lease state through a watch channel:
//!
//! - `Running` while renewals succeed
//! - `Lost` as soon as the store answers `false` (token mismatch or the run
//!   is terminal); never retried
//! - `Uncertain` after `failure_threshold` consecutive transport failures;
//!   ownership can no longer be proven, so the worker must stop
//! - `Stopped` when the owner asked the task to end
//!
//! `Lost` and `Uncertain` are terminal: the task publishes once and exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use leasehold_models::{HeartbeatRequest, LeaseToken, PanicReason, WorkerId};
use leasehold_store::{RunStore, StoreError};

use crate::claimer::bounded_call;
use crate::metrics::record_heartbeat;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub jitter: Duration,
    pub failure_threshold: u32,
    /// Delay before the next attempt after a transport failure
    pub failure_backoff: Duration,
    pub rpc_timeout: Duration,
    pub lease_minutes: u32,
}

/// Why the worker stopped trusting its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipLoss {
    pub reason: PanicReason,
    pub message: String,
    /// Latency of the last completed heartbeat call
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseState {
    Running,
    Lost(OwnershipLoss),
    Uncertain(OwnershipLoss),
    Stopped,
}

impl LeaseState {
    pub fn loss(&self) -> Option<&OwnershipLoss> {
        match self {
            LeaseState::Lost(loss) | LeaseState::Uncertain(loss) => Some(loss),
            _ => None,
        }
    }

    pub fn is_ownership_lost(&self) -> bool {
        self.loss().is_some()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Running => "running",
            LeaseState::Lost(_) => "lost",
            LeaseState::Uncertain(_) => "uncertain",
            LeaseState::Stopped => "stopped",
        }
    }
}

/// Counts consecutive transport failures.
#[derive(Debug)]
struct FailureStreak {
    consecutive_failures: u32,
    threshold: u32,
}

impl FailureStreak {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "Heartbeat recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    /// Returns true once the threshold is reached.
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= self.threshold
    }

    fn count(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Spawns the renewal task for one lease.
pub struct LeaseHeartbeat;

impl LeaseHeartbeat {
    pub fn spawn(
        store: Arc<dyn RunStore>,
        worker_id: WorkerId,
        lease: LeaseToken,
        config: HeartbeatConfig,
    ) -> HeartbeatHandle {
        let (state_tx, state_rx) = watch::channel(LeaseState::Running);
        let (stop_tx, stop_rx) = watch::channel(false);

        let span = tracing::info_span!(
            "heartbeat",
            run_id = %lease.run_id,
            worker_id = %worker_id
        );
        let task = tokio::spawn(
            heartbeat_loop(store, worker_id, lease, config, state_tx, stop_rx).instrument(span),
        );

        HeartbeatHandle {
            state_rx,
            stop_tx,
            task: Some(task),
        }
    }
}

async fn heartbeat_loop(
    store: Arc<dyn RunStore>,
    worker_id: WorkerId,
    lease: LeaseToken,
    config: HeartbeatConfig,
    state_tx: watch::Sender<LeaseState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut streak = FailureStreak::new(config.failure_threshold);
    // The first renewal of a run has no previous call to report on.
    let mut last_latency_ms: Option<u64> = None;

    loop {
        let delay = if streak.count() > 0 {
            config.failure_backoff.min(config.interval)
        } else {
            config.interval + random_jitter(config.jitter)
        };

        tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => {
                state_tx.send_replace(LeaseState::Stopped);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let req = HeartbeatRequest {
            run_id: lease.run_id.clone(),
            worker_id: worker_id.clone(),
            lock_token: lease.lock_token.clone(),
            lease_minutes: config.lease_minutes,
            latency_ms: last_latency_ms,
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => {
                state_tx.send_replace(LeaseState::Stopped);
                return;
            }
            result = bounded_call(config.rpc_timeout, "heartbeat", store.heartbeat(&req)) => result,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(true) => {
                streak.record_success();
                last_latency_ms = Some(latency_ms);
                record_heartbeat("ok", latency_ms);
                debug!(latency_ms, "Lease renewed");
            }
            Ok(false) => {
                record_heartbeat("lost", latency_ms);
                let loss = OwnershipLoss {
                    reason: PanicReason::LostLock,
                    message: "heartbeat rejected: lock token no longer matches or run is terminal"
                        .to_string(),
                    latency_ms: Some(latency_ms),
                    consecutive_failures: streak.count(),
                    detected_at: Utc::now(),
                };
                error!(latency_ms, "Lease lost");
                state_tx.send_replace(LeaseState::Lost(loss));
                return;
            }
            Err(e) => {
                record_heartbeat("error", latency_ms);
                if streak.record_failure() {
                    let loss = uncertain_loss(&e, streak.count(), last_latency_ms);
                    error!(
                        consecutive_failures = streak.count(),
                        "Lease ownership uncertain: {}", e
                    );
                    state_tx.send_replace(LeaseState::Uncertain(loss));
                    return;
                }
                warn!(
                    consecutive_failures = streak.count(),
                    threshold = config.failure_threshold,
                    "Heartbeat failed: {}", e
                );
            }
        }
    }
}

fn uncertain_loss(e: &StoreError, failures: u32, latency_ms: Option<u64>) -> OwnershipLoss {
    OwnershipLoss {
        reason: PanicReason::HeartbeatUncertain,
        message: format!(
            "{} consecutive heartbeat failures, last error: {}",
            failures, e
        ),
        latency_ms,
        consecutive_failures: failures,
        detected_at: Utc::now(),
    }
}

/// Resolves once stop is requested or every sender is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Owner's view of a running heartbeat task.
///
/// Dropping the handle aborts the task.
pub struct HeartbeatHandle {
    state_rx: watch::Receiver<LeaseState>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn state(&self) -> LeaseState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state_rx.clone()
    }

    /// The ownership loss, once one was detected.
    pub fn loss(&self) -> Option<OwnershipLoss> {
        self.state_rx.borrow().loss().cloned()
    }

    /// Stop the task and wait up to `grace` for it to exit. A task that does
    /// not exit in time is aborted, so no renewal can follow this call.
    pub async fn stop(mut self, grace: Duration) -> LeaseState {
        let _ = self.stop_tx.send(true);

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Heartbeat task ended abnormally: {}", e),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "Heartbeat did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        let state = self.state();
        info!(state = state.as_str(), "Heartbeat stopped");
        state
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_models::{ClaimRequest, LockToken, RunStatus};
    use leasehold_store::MemoryRunStore;

    fn fast_config(threshold: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(10),
            jitter: Duration::from_millis(2),
            failure_threshold: threshold,
            failure_backoff: Duration::from_millis(5),
            rpc_timeout: Duration::from_millis(200),
            lease_minutes: 1,
        }
    }

    async fn claimed(store: &MemoryRunStore, worker: &WorkerId) -> LeaseToken {
        let run_id = store.enqueue("r1", None);
        let token = LockToken::generate();
        store
            .claim_next(&ClaimRequest {
                worker_id: worker.clone(),
                lock_token: token.clone(),
                lease_minutes: 1,
                task_type: None,
            })
            .await
            .unwrap();
        LeaseToken::new(run_id, token)
    }

    async fn wait_for_terminal(handle: &HeartbeatHandle) -> LeaseState {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if current.is_ownership_lost() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        })
        .await
        .expect("heartbeat never reached a terminal state")
    }

    #[tokio::test]
    async fn test_renews_while_owned() {
        let store = Arc::new(MemoryRunStore::new());
        let worker = WorkerId::from_string("w1");
        let lease = claimed(&store, &worker).await;

        let handle = LeaseHeartbeat::spawn(store.clone(), worker, lease.clone(), fast_config(3));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), LeaseState::Running);

        let state = handle.stop(Duration::from_secs(1)).await;
        assert_eq!(state, LeaseState::Stopped);

        let stored = store.get(&lease.run_id).unwrap();
        assert!(stored.heartbeat_count >= 2);
        // Every renewal after the first reports the previous call's latency.
        assert!(stored.last_heartbeat_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_stale_token_is_lost() {
        let store = Arc::new(MemoryRunStore::new());
        let worker = WorkerId::from_string("w1");
        let lease = claimed(&store, &worker).await;
        let stale = LeaseToken::new(lease.run_id.clone(), LockToken::generate());

        let handle = LeaseHeartbeat::spawn(store.clone(), worker, stale, fast_config(3));
        let state = wait_for_terminal(&handle).await;

        let loss = state.loss().unwrap();
        assert!(matches!(state, LeaseState::Lost(_)));
        assert_eq!(loss.reason, PanicReason::LostLock);

        // The task exits after publishing; no further renewals.
        let attempts = store.heartbeat_attempts();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.heartbeat_attempts(), attempts);
    }

    #[tokio::test]
    async fn test_terminal_run_is_lost() {
        let store = Arc::new(MemoryRunStore::new());
        let worker = WorkerId::from_string("w1");
        let lease = claimed(&store, &worker).await;
        store.set_status(&lease.run_id, RunStatus::Aborted);

        let handle = LeaseHeartbeat::spawn(store.clone(), worker, lease, fast_config(3));
        let state = wait_for_terminal(&handle).await;
        assert!(matches!(state, LeaseState::Lost(_)));
    }

    #[tokio::test]
    async fn test_transport_failures_become_uncertain_once() {
        let store = Arc::new(MemoryRunStore::new());
        let worker = WorkerId::from_string("w1");
        let lease = claimed(&store, &worker).await;
        store.partition(&worker);

        let handle = LeaseHeartbeat::spawn(store.clone(), worker, lease, fast_config(3));
        let state = wait_for_terminal(&handle).await;

        let loss = state.loss().unwrap();
        assert!(matches!(state, LeaseState::Uncertain(_)));
        assert_eq!(loss.reason, PanicReason::HeartbeatUncertain);
        assert_eq!(loss.consecutive_failures, 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.heartbeat_attempts(), 3);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut streak = FailureStreak::new(3);
        assert!(!streak.record_failure());
        assert!(!streak.record_failure());
        streak.record_success();
        assert!(!streak.record_failure());
        assert!(!streak.record_failure());
        assert!(streak.record_failure());
    }

    #[tokio::test]
    async fn test_stop_before_first_tick_sends_nothing() {
        let store = Arc::new(MemoryRunStore::new());
        let worker = WorkerId::from_string("w1");
        let lease = claimed(&store, &worker).await;

        let mut config = fast_config(3);
        config.interval = Duration::from_secs(60);
        let handle = LeaseHeartbeat::spawn(store.clone(), worker, lease, config);
        let state = handle.stop(Duration::from_secs(1)).await;

        assert_eq!(state, LeaseState::Stopped);
        assert_eq!(store.heartbeat_attempts(), 0);
    }
}
