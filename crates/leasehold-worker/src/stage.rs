//! Pluggable stage execution.
//!
//! The worker treats each stage as opaque work. Ownership loss and shutdown
//! are only acted on between stages; a long stage that wants to stop sooner
//! watches [`StageContext::cancel`] and returns [`StageError::Cancelled`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

use leasehold_models::{Run, WorkerId};

use crate::heartbeat::LeaseState;

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Stage finished, with optional output stored in the checkpoint
    Completed(Option<Value>),
    /// Stage needs an external approval before the run can continue
    AwaitApproval { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    /// Stage could not finish. `permanent` failures cannot be resumed.
    #[error("Stage failed: {message}")]
    Failed { message: String, permanent: bool },

    /// Stage stopped early because the cancel signal fired.
    #[error("Stage cancelled")]
    Cancelled,
}

impl StageError {
    /// A failure the run may be resumed from later.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            permanent: true,
        }
    }
}

/// Cooperative cancellation seen by stage handlers.
///
/// Fires when the worker is shutting down or the heartbeat reports that
/// lease ownership is gone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    shutdown: watch::Receiver<bool>,
    lease: Option<watch::Receiver<LeaseState>>,
}

impl CancelSignal {
    pub fn new(
        shutdown: watch::Receiver<bool>,
        lease: Option<watch::Receiver<LeaseState>>,
    ) -> Self {
        Self { shutdown, lease }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            shutdown: rx,
            lease: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
            || self
                .lease
                .as_ref()
                .is_some_and(|rx| rx.borrow().is_ownership_lost())
    }

    /// Wait until the signal fires. Pending forever if it never can.
    pub async fn cancelled(&mut self) {
        let mut shutdown_open = true;
        let mut lease_open = self.lease.is_some();

        loop {
            if self.is_cancelled() {
                return;
            }
            if !shutdown_open && !lease_open {
                std::future::pending::<()>().await;
            }

            let shutdown = &mut self.shutdown;
            let lease = &mut self.lease;
            tokio::select! {
                res = shutdown.changed(), if shutdown_open => {
                    shutdown_open = res.is_ok();
                }
                res = lease_changed(lease), if lease_open => {
                    lease_open = res;
                }
            }
        }
    }
}

async fn lease_changed(rx: &mut Option<watch::Receiver<LeaseState>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => false,
    }
}

/// Everything a stage handler may look at.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run: Run,
    pub worker_id: WorkerId,
    pub stage: String,
    /// Outputs of the stages completed so far, keyed by stage name
    pub prior_outputs: BTreeMap<String, Value>,
    pub cancel: CancelSignal,
}

/// The pipeline executed for every claimed run.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Stage names in execution order.
    fn stages(&self) -> Vec<String>;

    async fn run_stage(&self, stage: &str, ctx: &StageContext) -> Result<StageOutcome, StageError>;
}

/// Runs a fixed list of named stages that only record a small output.
#[derive(Debug, Clone)]
pub struct StubStageRunner {
    stages: Vec<String>,
    step_delay: Duration,
}

impl StubStageRunner {
    pub fn new(stages: Vec<String>) -> Self {
        Self {
            stages,
            step_delay: Duration::from_millis(250),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl StageRunner for StubStageRunner {
    fn stages(&self) -> Vec<String> {
        self.stages.clone()
    }

    async fn run_stage(&self, stage: &str, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let mut cancel = ctx.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            _ = tokio::time::sleep(self.step_delay) => {}
        }

        Ok(StageOutcome::Completed(Some(json!({
            "stage": stage,
            "run_id": ctx.run.run_id,
            "inputs": ctx.prior_outputs.keys().collect::<Vec<_>>(),
            "completed_at": Utc::now(),
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_models::{LockToken, PanicReason, RunId};

    use crate::heartbeat::OwnershipLoss;

    fn context(cancel: CancelSignal) -> StageContext {
        StageContext {
            run: Run::claimed(
                RunId::from_string("r1"),
                WorkerId::from_string("w1"),
                LockToken::generate(),
                15,
            ),
            worker_id: WorkerId::from_string("w1"),
            stage: "research".to_string(),
            prior_outputs: BTreeMap::new(),
            cancel,
        }
    }

    #[tokio::test]
    async fn test_stub_runner_records_output() {
        let runner = StubStageRunner::new(vec!["research".into(), "prompt".into()])
            .with_step_delay(Duration::from_millis(1));
        assert_eq!(runner.stages(), vec!["research", "prompt"]);

        let outcome = runner
            .run_stage("research", &context(CancelSignal::never()))
            .await
            .unwrap();
        match outcome {
            StageOutcome::Completed(Some(data)) => assert_eq!(data["stage"], "research"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stub_stage() {
        let (tx, rx) = watch::channel(false);
        let runner = StubStageRunner::new(vec!["research".into()])
            .with_step_delay(Duration::from_secs(30));
        let ctx = context(CancelSignal::new(rx, None));

        let stage = tokio::spawn(async move { runner.run_stage("research", &ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), stage)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(StageError::Cancelled));
    }

    #[tokio::test]
    async fn test_lease_loss_fires_signal() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (lease_tx, lease_rx) = watch::channel(LeaseState::Running);
        let mut signal = CancelSignal::new(shutdown_rx, Some(lease_rx));
        assert!(!signal.is_cancelled());

        lease_tx.send_replace(LeaseState::Lost(OwnershipLoss {
            reason: PanicReason::LostLock,
            message: "rejected".into(),
            latency_ms: None,
            consecutive_failures: 0,
            detected_at: Utc::now(),
        }));
        drop(lease_tx);

        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let mut signal = CancelSignal::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(waited.is_err());
    }
}
