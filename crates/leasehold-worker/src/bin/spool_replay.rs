//! One-shot panic spool replay.
//!
//! Exit codes: 0 when nothing is quarantined, 2 when quarantined records
//! exist, 1 when replay could not run.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use leasehold_store::HttpRunStore;
use leasehold_worker::panic::ReporterConfig;
use leasehold_worker::{
    LogNotifier, Notifier, PanicReporter, PanicSpool, WebhookNotifier, WorkerConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match replay().await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(quarantined) => {
            warn!(quarantined, "Undeliverable panic events remain in quarantine");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("spool replay failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn replay() -> Result<usize> {
    let config = WorkerConfig::from_env();
    let store = HttpRunStore::from_env().context("run store client")?;

    let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone(), config.rpc_timeout).context("alert webhook client")?,
        ),
        None => Arc::new(LogNotifier),
    };

    let spool = PanicSpool::new(config.spool_dir())
        .await
        .context("open panic spool")?;
    let reporter = PanicReporter::new(
        Arc::new(store),
        spool,
        notifier,
        ReporterConfig {
            rpc_timeout: config.rpc_timeout,
            max_attempts: config.spool_max_attempts,
            alert_max_chars: config.alert_max_chars,
        },
    );

    let summary = reporter.replay_spool().await.context("replay spool")?;
    info!(
        scanned = summary.scanned,
        delivered = summary.delivered,
        retried = summary.retried,
        quarantined = summary.quarantined,
        bad = summary.bad,
        quarantine_total = summary.quarantine_total,
        "Spool replay finished"
    );
    Ok(summary.quarantine_total)
}
