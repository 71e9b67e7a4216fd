//! The poll, claim, execute, report cycle.
//!
//! ```text
//! IDLE -> CLAIMING -> (no work) IDLE
//!                  -> RUNNING -> DONE | FAILED | INTERRUPTED | AWAITING_APPROVAL | PANIC
//! ```
//!
//! Every run gets its own heartbeat task, which is always stopped (bounded by
//! the configured grace) before the loop touches any other run.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use leasehold_models::{
    Checkpoint, CheckpointTag, LeaseToken, PanicReason, Run, RunId, RunPatch, WorkerId,
};
use leasehold_store::{with_retry, RunStore};

use crate::checkpoint::CheckpointStore;
use crate::claimer::{bounded_call, RunClaimer};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::heartbeat::{HeartbeatHandle, LeaseHeartbeat, OwnershipLoss};
use crate::logging::RunLogger;
use crate::metrics::{record_outcome, record_stage};
use crate::panic::{Notifier, PanicReporter, PanicSpool, ReplaySummary, ReporterConfig};
use crate::stage::{CancelSignal, StageContext, StageError, StageOutcome, StageRunner};

/// How a single iteration ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing to claim
    Idle,
    Completed { run_id: RunId },
    Failed { run_id: RunId, message: String },
    /// Shutdown requested between stages; the run can be resumed
    Interrupted { run_id: RunId },
    AwaitingApproval { run_id: RunId, reason: String },
    /// Lease ownership was lost or could not be proven
    Panicked { run_id: RunId, reason: PanicReason },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Idle => "idle",
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Interrupted { .. } => "interrupted",
            RunOutcome::AwaitingApproval { .. } => "awaiting_approval",
            RunOutcome::Panicked { .. } => "panicked",
        }
    }
}

/// Why the stage loop stopped.
enum StageExit {
    Done,
    Failed {
        stage: String,
        message: String,
        permanent: bool,
    },
    Interrupted {
        stage: Option<String>,
    },
    AwaitApproval {
        stage: String,
        reason: String,
    },
    OwnershipLost {
        stage: Option<String>,
        loss: OwnershipLoss,
    },
    CorruptCheckpoint(String),
}

pub struct WorkerLoop {
    config: WorkerConfig,
    store: Arc<dyn RunStore>,
    claimer: RunClaimer,
    checkpoints: CheckpointStore,
    reporter: PanicReporter,
    runner: Arc<dyn StageRunner>,
    shutdown: watch::Sender<bool>,
}

impl WorkerLoop {
    /// Build a worker. Creates the checkpoint and spool directories.
    pub async fn new(
        config: WorkerConfig,
        store: Arc<dyn RunStore>,
        runner: Arc<dyn StageRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> WorkerResult<Self> {
        config.validate()?;

        let checkpoints = CheckpointStore::new(config.checkpoint_dir()).await?;
        let spool = PanicSpool::new(config.spool_dir()).await?;
        let reporter = PanicReporter::new(
            store.clone(),
            spool,
            notifier,
            ReporterConfig {
                rpc_timeout: config.rpc_timeout,
                max_attempts: config.spool_max_attempts,
                alert_max_chars: config.alert_max_chars,
            },
        );
        let claimer = RunClaimer::new(
            store.clone(),
            config.lease_minutes,
            config.task_type.clone(),
            config.rpc_timeout,
            config.store_retry.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            claimer,
            checkpoints,
            reporter,
            runner,
            shutdown,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn reporter(&self) -> &PanicReporter {
        &self.reporter
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Signal shutdown. The current stage finishes; the run is checkpointed
    /// as interrupted at the next boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown.
    ///
    /// Returns `Err` only for hard local durability failures.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            worker_id = %self.config.worker_id,
            lease_minutes = self.config.lease_minutes,
            "Starting worker loop"
        );

        self.replay_spool().await;
        let mut last_replay = Instant::now();

        while !self.is_shutting_down() {
            let outcome = self.run_once().await?;

            match outcome {
                RunOutcome::Idle => {
                    if last_replay.elapsed() >= self.config.spool_replay_interval {
                        self.replay_spool().await;
                        last_replay = Instant::now();
                    }
                    self.pause(self.config.poll_interval).await;
                }
                RunOutcome::Panicked { .. } => {
                    info!(
                        quarantine_secs = self.config.panic_quarantine.as_secs(),
                        "Pausing before claiming new work"
                    );
                    self.pause(self.config.panic_quarantine).await;
                }
                _ => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker loop stopped");
        Ok(())
    }

    /// Sleep unless shutdown arrives first.
    async fn pause(&self, duration: std::time::Duration) {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Replay the panic spool, logging instead of failing.
    pub async fn replay_spool(&self) -> Option<ReplaySummary> {
        match self.reporter.replay_spool().await {
            Ok(summary) => {
                if summary.scanned > 0 || summary.quarantine_total > 0 {
                    info!(
                        delivered = summary.delivered,
                        retried = summary.retried,
                        quarantined = summary.quarantined,
                        bad = summary.bad,
                        quarantine_total = summary.quarantine_total,
                        "Spool replay finished"
                    );
                }
                Some(summary)
            }
            Err(e) => {
                warn!("Spool replay failed: {}", e);
                None
            }
        }
    }

    /// Claim and process at most one run.
    pub async fn run_once(&self) -> WorkerResult<RunOutcome> {
        match self.claimer.claim_next(&self.config.worker_id).await {
            Some(run) => self.process_run(run).await,
            None => Ok(RunOutcome::Idle),
        }
    }

    /// Execute a claimed run to one of its exits.
    pub async fn process_run(&self, run: Run) -> WorkerResult<RunOutcome> {
        let lease = run.lease_token().ok_or_else(|| {
            WorkerError::config_error(format!("claimed run {} carries no lock token", run.run_id))
        })?;
        let logger = RunLogger::new(&run.run_id, &self.config.worker_id, "run");
        let span = logger.create_span();

        async {
            logger.log_start(&format!("lease {} minutes", self.config.lease_minutes));

            let heartbeat = LeaseHeartbeat::spawn(
                self.store.clone(),
                self.config.worker_id.clone(),
                lease.clone(),
                self.config.heartbeat_config(),
            );

            let executed = self.execute_stages(&run, &lease, &heartbeat, &logger).await;
            let final_state = heartbeat.stop(self.config.heartbeat_stop_grace).await;
            debug!(state = final_state.as_str(), "Heartbeat finished");

            let (exit, checkpoint) = executed?;
            let outcome = self.finish(&run, &lease, exit, checkpoint, &logger).await?;

            record_outcome(outcome.as_str());
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn execute_stages(
        &self,
        run: &Run,
        lease: &LeaseToken,
        heartbeat: &HeartbeatHandle,
        logger: &RunLogger,
    ) -> WorkerResult<(StageExit, Checkpoint)> {
        let mut checkpoint = match self.checkpoints.load(&run.run_id).await {
            Ok(cp) => cp,
            Err(WorkerError::Checkpoint(msg)) => {
                return Ok((
                    StageExit::CorruptCheckpoint(msg),
                    Checkpoint::empty(run.run_id.clone()),
                ));
            }
            Err(e) => return Err(e),
        };
        if !checkpoint.is_empty() {
            logger.log_stage(
                checkpoint.current_stage.as_deref().unwrap_or("-"),
                &format!("resuming with {:?} completed", checkpoint.completed_stages),
            );
        }

        for stage in self.runner.stages() {
            if checkpoint.is_completed(&stage) {
                debug!(stage = %stage, "Skipping completed stage");
                continue;
            }

            if let Some(loss) = heartbeat.loss() {
                return Ok((
                    StageExit::OwnershipLost {
                        stage: Some(stage),
                        loss,
                    },
                    checkpoint,
                ));
            }
            if self.is_shutting_down() {
                return Ok((StageExit::Interrupted { stage: Some(stage) }, checkpoint));
            }

            logger.log_stage(&stage, "started");
            let ctx = StageContext {
                run: run.clone(),
                worker_id: self.config.worker_id.clone(),
                stage: stage.clone(),
                prior_outputs: checkpoint.data.clone(),
                cancel: CancelSignal::new(self.shutdown.subscribe(), Some(heartbeat.subscribe())),
            };

            match self.runner.run_stage(&stage, &ctx).await {
                Ok(StageOutcome::Completed(data)) => {
                    checkpoint = self
                        .checkpoints
                        .save(&run.run_id, &stage, &lease.lock_token, data)
                        .await?;
                    record_stage("completed");
                    logger.log_stage(&stage, "completed");
                }
                Ok(StageOutcome::AwaitApproval { reason }) => {
                    record_stage("awaiting_approval");
                    return Ok((StageExit::AwaitApproval { stage, reason }, checkpoint));
                }
                Err(StageError::Cancelled) => {
                    record_stage("cancelled");
                    let exit = match heartbeat.loss() {
                        Some(loss) => StageExit::OwnershipLost {
                            stage: Some(stage),
                            loss,
                        },
                        None => StageExit::Interrupted { stage: Some(stage) },
                    };
                    return Ok((exit, checkpoint));
                }
                Err(StageError::Failed { message, permanent }) => {
                    record_stage("failed");
                    return Ok((
                        StageExit::Failed {
                            stage,
                            message,
                            permanent,
                        },
                        checkpoint,
                    ));
                }
            }
        }

        // The last stage boundary: never report success without ownership.
        if let Some(loss) = heartbeat.loss() {
            return Ok((StageExit::OwnershipLost { stage: None, loss }, checkpoint));
        }
        Ok((StageExit::Done, checkpoint))
    }

    async fn finish(
        &self,
        run: &Run,
        lease: &LeaseToken,
        exit: StageExit,
        checkpoint: Checkpoint,
        logger: &RunLogger,
    ) -> WorkerResult<RunOutcome> {
        let run_id = run.run_id.clone();
        let worker_id = &self.config.worker_id;

        match exit {
            StageExit::Done => {
                let patch = RunPatch::done(checkpoint.completed_stages.clone());
                if self.patch_status(&run_id, &patch).await {
                    self.checkpoints.clear(&run_id).await?;
                    self.claimer.release(lease, worker_id).await;
                } else {
                    // Held lease: the next claim recovers the run and only
                    // retries the patch.
                    logger.log_warning("completion not recorded remotely; lease and checkpoint kept");
                }
                logger.log_completion("completed", &format!("{:?}", checkpoint.completed_stages));
                Ok(RunOutcome::Completed { run_id })
            }

            StageExit::Failed {
                stage,
                message,
                permanent,
            } => {
                let message = truncate_message(
                    &format!("stage {} failed: {}", stage, message),
                    self.config.failure_message_max_chars,
                );
                logger.log_error(&message);

                if permanent {
                    self.checkpoints.clear(&run_id).await?;
                } else {
                    self.checkpoints
                        .persist_position(&run_id, Some(&stage), &lease.lock_token, CheckpointTag::Failed)
                        .await?;
                }
                let patch = RunPatch::failed(message.clone(), checkpoint.completed_stages.clone());
                self.patch_status(&run_id, &patch).await;
                self.claimer.release(lease, worker_id).await;
                logger.log_completion("failed", &message);
                Ok(RunOutcome::Failed { run_id, message })
            }

            StageExit::Interrupted { stage } => {
                self.checkpoints
                    .persist_position(
                        &run_id,
                        stage.as_deref(),
                        &lease.lock_token,
                        CheckpointTag::Interrupted,
                    )
                    .await?;
                self.claimer.release(lease, worker_id).await;
                logger.log_completion("interrupted", "shutdown requested between stages");
                Ok(RunOutcome::Interrupted { run_id })
            }

            StageExit::AwaitApproval { stage, reason } => {
                self.checkpoints
                    .persist_position(
                        &run_id,
                        Some(&stage),
                        &lease.lock_token,
                        CheckpointTag::AwaitingApproval,
                    )
                    .await?;
                let patch = RunPatch::waiting_approval(checkpoint.completed_stages.clone());
                self.patch_status(&run_id, &patch).await;
                self.claimer.release(lease, worker_id).await;
                logger.log_completion("awaiting_approval", &reason);
                Ok(RunOutcome::AwaitingApproval { run_id, reason })
            }

            StageExit::OwnershipLost { stage, loss } => {
                logger.log_error(&format!("{}: {}", loss.reason, loss.message));
                let report = self
                    .reporter
                    .report_panic(
                        &run_id,
                        worker_id,
                        loss.reason,
                        &loss.message,
                        loss.latency_ms,
                        loss.consecutive_failures,
                    )
                    .await?;
                if !report.fully_delivered() {
                    logger.log_warning("panic left in spool for replay");
                }

                let position = stage.or_else(|| checkpoint.current_stage.clone());
                self.checkpoints
                    .persist_position(
                        &run_id,
                        position.as_deref(),
                        &lease.lock_token,
                        CheckpointTag::Panic,
                    )
                    .await?;
                // No release: ownership is exactly what can no longer be trusted.
                logger.log_completion("panicked", loss.reason.key());
                Ok(RunOutcome::Panicked {
                    run_id,
                    reason: loss.reason,
                })
            }

            StageExit::CorruptCheckpoint(msg) => {
                let message = truncate_message(&msg, self.config.failure_message_max_chars);
                logger.log_error(&message);
                let patch = RunPatch::failed(message.clone(), Vec::new());
                self.patch_status(&run_id, &patch).await;
                self.claimer.release(lease, worker_id).await;
                Ok(RunOutcome::Failed { run_id, message })
            }
        }
    }

    /// Best-effort status write with retry. Returns whether it was accepted.
    async fn patch_status(&self, run_id: &RunId, patch: &RunPatch) -> bool {
        let result = with_retry(&self.config.store_retry, "patch_run_status", || {
            bounded_call(
                self.config.rpc_timeout,
                "patch_run_status",
                self.store.patch_run_status(run_id, patch),
            )
        })
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(run_id = %run_id, status = ?patch.status, "Status update failed: {}", e);
                false
            }
        }
    }
}

/// Bound a message to `max_chars`, cutting at a char boundary.
fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
