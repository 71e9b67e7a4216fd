//! Lease-holding worker binary.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use leasehold_store::HttpRunStore;
use leasehold_worker::{
    metrics, Cli, LogNotifier, Notifier, RunOutcome, StubStageRunner, WebhookNotifier,
    WorkerConfig, WorkerLoop,
};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("leasehold=info,leasehold_store=info,leasehold_worker=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting leasehold-worker");

    let mut config = WorkerConfig::from_env();
    cli.apply(&mut config);
    info!("Worker config: {:?}", config);

    if let Some(addr) = &config.metrics_addr {
        if let Err(e) = metrics::install_exporter(addr) {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
        info!(addr = %addr, "Metrics exporter listening");
    }

    let store = match HttpRunStore::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create run store client: {}", e);
            std::process::exit(1);
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
        Some(url) => match WebhookNotifier::new(url.clone(), config.rpc_timeout) {
            Ok(n) => Arc::new(n),
            Err(e) => {
                error!("Failed to create alert webhook client: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("ALERT_WEBHOOK_URL not set, operator alerts go to the log");
            Arc::new(LogNotifier)
        }
    };

    let runner = Arc::new(StubStageRunner::new(config.stages.clone()));

    let worker = match WorkerLoop::new(config, Arc::new(store), runner, notifier).await {
        Ok(w) => Arc::new(w),
        Err(e) => {
            error!("Failed to create worker: {}", e);
            std::process::exit(1);
        }
    };

    let signal_worker = Arc::clone(&worker);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_worker.shutdown();
    });

    let result = if cli.once {
        worker.replay_spool().await;
        worker.run_once().await.map(|outcome| {
            if outcome == RunOutcome::Idle {
                info!("No work available");
            }
        })
    } else {
        worker.run().await
    };

    if let Err(e) = result {
        if e.is_durability() {
            error!("Local state could not be persisted, stopping: {}", e);
        } else {
            error!("Worker stopped on unrecoverable error: {}", e);
        }
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
