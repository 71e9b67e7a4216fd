//! Local-first panic reporting.
//!
//! A panic goes through three phases:
//!
//! 1. **Spool**: the event is written to local durable storage. This is the
//!    only phase allowed to fail the call.
//! 2. **Remote mark**: the run row is patched with the panic fields and a
//!    forensic event row is inserted. A duplicate event id counts as success.
//! 3. **Alert**: plain text to the operator channel.
//!
//! Phases 2 and 3 report a [`DeliveryOutcome`] that the caller logs. The
//! spool file is removed only once both have succeeded; otherwise it stays
//! for [`PanicReporter::replay_spool`], which skips phases already done.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use leasehold_models::{PanicEvent, PanicReason, RunEvent, RunId, RunPatch, WorkerId};
use leasehold_store::{RunStore, StoreResult};

use crate::claimer::bounded_call;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::{record_panic, record_spool_replay};
use crate::panic::alert::format_alert;
use crate::panic::notifier::Notifier;
use crate::panic::spool::{PanicSpool, SpoolRecord};

/// Result of a best-effort phase.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Already delivered by an earlier attempt
    Skipped,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered | DeliveryOutcome::Skipped)
    }

    fn error(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// What happened to one panic.
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub event: PanicEvent,
    /// Where the event was spooled; gone if everything was delivered
    pub spool_path: PathBuf,
    pub remote: DeliveryOutcome,
    pub alert: DeliveryOutcome,
}

impl PanicReport {
    pub fn fully_delivered(&self) -> bool {
        self.remote.is_done() && self.alert.is_done()
    }
}

/// Totals from one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub scanned: usize,
    pub delivered: usize,
    pub retried: usize,
    pub quarantined: usize,
    pub bad: usize,
    /// Records in quarantine after this pass, including older ones
    pub quarantine_total: usize,
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub rpc_timeout: Duration,
    pub max_attempts: u32,
    pub alert_max_chars: usize,
}

pub struct PanicReporter {
    store: Arc<dyn RunStore>,
    spool: PanicSpool,
    notifier: Arc<dyn Notifier>,
    config: ReporterConfig,
}

impl PanicReporter {
    pub fn new(
        store: Arc<dyn RunStore>,
        spool: PanicSpool,
        notifier: Arc<dyn Notifier>,
        config: ReporterConfig,
    ) -> Self {
        Self {
            store,
            spool,
            notifier,
            config,
        }
    }

    pub fn spool(&self) -> &PanicSpool {
        &self.spool
    }

    /// Record that `worker_id` can no longer trust its ownership of `run_id`.
    ///
    /// Returns `Err` only when the event could not be spooled.
    pub async fn report_panic(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        reason: PanicReason,
        message: &str,
        latency_ms: Option<u64>,
        retry_count: u32,
    ) -> WorkerResult<PanicReport> {
        let event = PanicEvent::new(run_id.clone(), worker_id.clone(), reason, message)
            .with_latency(latency_ms)
            .with_retry_count(retry_count);
        record_panic(reason.key());

        let mut record = SpoolRecord::new(event.clone());
        let spool_path = self.spool.write(&record).await.map_err(|e| {
            error!(
                run_id = %run_id,
                event_id = %event.event_id,
                "Failed to spool panic event: {}", e
            );
            e
        })?;
        info!(
            run_id = %run_id,
            event_id = %event.event_id,
            reason = %reason,
            path = %spool_path.display(),
            "Panic event spooled"
        );

        let (remote, alert) = self.deliver(&mut record).await;
        self.settle(&spool_path, &record).await;

        Ok(PanicReport {
            event,
            spool_path,
            remote,
            alert,
        })
    }

    /// One delivery attempt for whichever phases are still outstanding.
    async fn deliver(&self, record: &mut SpoolRecord) -> (DeliveryOutcome, DeliveryOutcome) {
        record.attempts += 1;

        let remote = if record.remote_acked {
            DeliveryOutcome::Skipped
        } else {
            self.mark_remote(&record.event).await
        };
        let alert = if record.alert_sent {
            DeliveryOutcome::Skipped
        } else {
            self.send_alert(&record.event).await
        };

        record.remote_acked |= remote.is_done();
        record.alert_sent |= alert.is_done();
        record.last_error = remote
            .error()
            .or(alert.error())
            .map(|e| e.to_string());

        (remote, alert)
    }

    /// Remove a delivered record, or persist its progress.
    ///
    /// The spool write already succeeded, so a failure here is logged and
    /// the record is simply replayed from its previous state.
    async fn settle(&self, path: &Path, record: &SpoolRecord) {
        let result = if record.is_delivered() {
            self.spool.remove(path).await
        } else {
            self.spool.update(path, record).await
        };
        if let Err(e) = result {
            warn!(
                event_id = %record.event.event_id,
                path = %path.display(),
                "Could not update spool record: {}", e
            );
        }
    }

    async fn mark_remote(&self, event: &PanicEvent) -> DeliveryOutcome {
        match self.try_mark_remote(event).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => {
                warn!(
                    run_id = %event.run_id,
                    event_id = %event.event_id,
                    "Remote panic mark failed: {}", e
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_mark_remote(&self, event: &PanicEvent) -> StoreResult<()> {
        let timeout = self.config.rpc_timeout;
        let patch = RunPatch::panic(event);
        bounded_call(
            timeout,
            "patch_run_status",
            self.store.patch_run_status(&event.run_id, &patch),
        )
        .await?;

        let row = RunEvent::from_panic(event);
        let outcome = bounded_call(timeout, "insert_event", self.store.insert_event(&row)).await?;
        debug!(event_id = %event.event_id, ?outcome, "Panic event recorded");
        Ok(())
    }

    async fn send_alert(&self, event: &PanicEvent) -> DeliveryOutcome {
        let text = format_alert(event, self.config.alert_max_chars);
        let sent = tokio::time::timeout(self.config.rpc_timeout, self.notifier.notify(&text)).await;
        match sent {
            Ok(Ok(())) => DeliveryOutcome::Delivered,
            Ok(Err(e)) => {
                warn!(event_id = %event.event_id, "Operator alert failed: {}", e);
                DeliveryOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(event_id = %event.event_id, "Operator alert timed out");
                DeliveryOutcome::Failed("alert timed out".to_string())
            }
        }
    }

    /// Retry every spooled record once.
    ///
    /// Delivered records are deleted, unparseable ones move to `bad/`, and
    /// records that used up their attempts move to `quarantine/`.
    pub async fn replay_spool(&self) -> WorkerResult<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        for path in self.spool.list().await? {
            summary.scanned += 1;

            let mut record = match self.spool.read(&path).await {
                Ok(record) => record,
                Err(WorkerError::Json(e)) => {
                    warn!(path = %path.display(), "Unparseable spool record: {}", e);
                    self.spool.move_to_bad(&path).await?;
                    record_spool_replay("bad");
                    summary.bad += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), "Cannot read spool record: {}", e);
                    continue;
                }
            };

            if record.attempts >= self.config.max_attempts {
                self.quarantine(&path, &record).await?;
                summary.quarantined += 1;
                continue;
            }

            self.deliver(&mut record).await;

            if record.is_delivered() {
                self.spool.remove(&path).await?;
                record_spool_replay("delivered");
                info!(event_id = %record.event.event_id, "Replayed panic event");
                summary.delivered += 1;
            } else if record.attempts >= self.config.max_attempts {
                self.spool.update(&path, &record).await?;
                self.quarantine(&path, &record).await?;
                summary.quarantined += 1;
            } else {
                self.spool.update(&path, &record).await?;
                record_spool_replay("retry");
                summary.retried += 1;
            }
        }

        summary.quarantine_total = self.spool.quarantine_count().await?;
        Ok(summary)
    }

    async fn quarantine(&self, path: &Path, record: &SpoolRecord) -> WorkerResult<()> {
        let dst = self.spool.quarantine(path).await?;
        record_spool_replay("quarantined");
        error!(
            event_id = %record.event.event_id,
            run_id = %record.event.run_id,
            attempts = record.attempts,
            last_error = record.last_error.as_deref().unwrap_or(""),
            path = %dst.display(),
            "Panic event quarantined after exhausting retries"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use leasehold_store::MemoryRunStore;
    use tempfile::TempDir;

    use crate::panic::notifier::NotifyError;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
        failing: Mutex<bool>,
    }

    impl RecordingNotifier {
        fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, text: &str) -> Result<(), NotifyError> {
            if *self.failing.lock().unwrap() {
                return Err(NotifyError::Rejected(503));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryRunStore>,
        notifier: Arc<RecordingNotifier>,
        reporter: PanicReporter,
        run_id: RunId,
        worker: WorkerId,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRunStore::new());
        let run_id = store.enqueue("run-1", None);
        let notifier = Arc::new(RecordingNotifier::default());
        let spool = PanicSpool::new(dir.path().join("spool")).await.unwrap();
        let reporter = PanicReporter::new(
            store.clone(),
            spool,
            notifier.clone(),
            ReporterConfig {
                rpc_timeout: Duration::from_secs(1),
                max_attempts,
                alert_max_chars: 4000,
            },
        );
        Fixture {
            _dir: dir,
            store,
            notifier,
            reporter,
            run_id,
            worker: WorkerId::from_string("w1"),
        }
    }

    #[tokio::test]
    async fn test_delivered_panic_leaves_no_spool_file() {
        let f = fixture(5).await;
        let report = f
            .reporter
            .report_panic(&f.run_id, &f.worker, PanicReason::LostLock, "rejected", Some(9), 0)
            .await
            .unwrap();

        assert!(report.fully_delivered());
        assert!(!report.spool_path.exists());
        assert_eq!(f.store.events().len(), 1);
        assert_eq!(f.notifier.count(), 1);

        let stored = f.store.get(&f.run_id).unwrap();
        let patch = stored.last_patch.unwrap();
        assert_eq!(patch.panic_reason, Some(PanicReason::LostLock));
        assert_eq!(patch.panic_event_id, Some(report.event.event_id));
    }

    #[tokio::test]
    async fn test_store_down_keeps_exactly_one_spool_file() {
        let f = fixture(5).await;
        f.store.set_unavailable(true);

        let report = f
            .reporter
            .report_panic(
                &f.run_id,
                &f.worker,
                PanicReason::HeartbeatUncertain,
                "3 failures",
                None,
                3,
            )
            .await
            .unwrap();

        assert!(matches!(report.remote, DeliveryOutcome::Failed(_)));
        assert_eq!(report.alert, DeliveryOutcome::Delivered);

        let files = f.reporter.spool().list().await.unwrap();
        assert_eq!(files, vec![report.spool_path.clone()]);
        let record = f.reporter.spool().read(&files[0]).await.unwrap();
        assert_eq!(record.event.event_id, report.event.event_id);
        assert!(!record.remote_acked);
        assert!(record.alert_sent);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_replay_delivers_once_and_never_realerts() {
        let f = fixture(5).await;
        f.store.set_unavailable(true);
        f.reporter
            .report_panic(&f.run_id, &f.worker, PanicReason::LostLock, "rejected", None, 0)
            .await
            .unwrap();
        assert_eq!(f.notifier.count(), 1);

        f.store.set_unavailable(false);
        let summary = f.reporter.replay_spool().await.unwrap();

        assert_eq!(summary.delivered, 1);
        assert!(f.reporter.spool().list().await.unwrap().is_empty());
        assert_eq!(f.store.events().len(), 1);
        assert_eq!(f.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_replaying_same_record_twice_is_idempotent() {
        let f = fixture(5).await;
        let event = PanicEvent::new(
            f.run_id.clone(),
            f.worker.clone(),
            PanicReason::LostLock,
            "rejected",
        );
        let record = SpoolRecord::new(event);

        f.reporter.spool().write(&record).await.unwrap();
        let first = f.reporter.replay_spool().await.unwrap();
        assert_eq!(first.delivered, 1);
        assert!(f.reporter.spool().list().await.unwrap().is_empty());

        // A copy of the same record shows up again, e.g. restored from backup.
        f.reporter.spool().write(&record).await.unwrap();
        let second = f.reporter.replay_spool().await.unwrap();
        assert_eq!(second.delivered, 1);

        assert_eq!(f.store.events().len(), 1);
        assert!(f.reporter.spool().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_records_are_quarantined() {
        let f = fixture(2).await;
        f.store.set_unavailable(true);
        f.notifier.set_failing(true);

        f.reporter
            .report_panic(&f.run_id, &f.worker, PanicReason::LostLock, "rejected", None, 0)
            .await
            .unwrap();

        let summary = f.reporter.replay_spool().await.unwrap();
        assert_eq!(summary.quarantined, 1);
        assert_eq!(summary.quarantine_total, 1);
        assert!(f.reporter.spool().list().await.unwrap().is_empty());

        let summary = f.reporter.replay_spool().await.unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(summary.quarantine_total, 1);
    }

    #[tokio::test]
    async fn test_unparseable_record_moves_to_bad() {
        let f = fixture(5).await;
        let path = f.reporter.spool().dir().join("1_garbage.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let summary = f.reporter.replay_spool().await.unwrap();
        assert_eq!(summary.bad, 1);
        assert!(!path.exists());
        assert!(f.reporter.spool().bad_dir().join("1_garbage.json").exists());
    }

    #[tokio::test]
    async fn test_spool_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let spool_dir = dir.path().join("spool");
        let spool = PanicSpool::new(&spool_dir).await.unwrap();
        // Replace the spool directory with a plain file so writes fail.
        tokio::fs::remove_dir_all(&spool_dir).await.unwrap();
        tokio::fs::write(&spool_dir, b"").await.unwrap();

        let reporter = PanicReporter::new(
            Arc::new(MemoryRunStore::new()),
            spool,
            Arc::new(RecordingNotifier::default()),
            ReporterConfig {
                rpc_timeout: Duration::from_secs(1),
                max_attempts: 5,
                alert_max_chars: 4000,
            },
        );
        let err = reporter
            .report_panic(
                &RunId::from_string("r1"),
                &WorkerId::from_string("w1"),
                PanicReason::LostLock,
                "x",
                None,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spool(_)));
    }
}
