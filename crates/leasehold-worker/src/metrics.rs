//! Worker metrics.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

pub mod names {
    pub const RUNS_CLAIMED_TOTAL: &str = "worker_runs_claimed_total";
    pub const RUN_OUTCOMES_TOTAL: &str = "worker_run_outcomes_total";
    pub const HEARTBEATS_TOTAL: &str = "worker_heartbeats_total";
    pub const HEARTBEAT_LATENCY_SECONDS: &str = "worker_heartbeat_latency_seconds";
    pub const PANICS_TOTAL: &str = "worker_panics_total";
    pub const SPOOL_REPLAY_TOTAL: &str = "worker_spool_replay_total";
    pub const STAGES_TOTAL: &str = "worker_stages_total";
}

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn install_exporter(addr: &str) -> WorkerResult<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| WorkerError::config_error(format!("invalid METRICS_ADDR {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

pub fn record_claim() {
    counter!(names::RUNS_CLAIMED_TOTAL).increment(1);
}

pub fn record_outcome(outcome: &str) {
    counter!(names::RUN_OUTCOMES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// `result` is one of `ok`, `lost`, `error`.
pub fn record_heartbeat(result: &str, latency_ms: u64) {
    counter!(names::HEARTBEATS_TOTAL, "result" => result.to_string()).increment(1);
    histogram!(names::HEARTBEAT_LATENCY_SECONDS).record(latency_ms as f64 / 1000.0);
}

pub fn record_panic(reason: &str) {
    counter!(names::PANICS_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_spool_replay(result: &str) {
    counter!(names::SPOOL_REPLAY_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn record_stage(result: &str) {
    counter!(names::STAGES_TOTAL, "result" => result.to_string()).increment(1);
}
