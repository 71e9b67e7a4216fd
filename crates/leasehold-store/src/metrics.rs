//! Run store request metrics.

use metrics::{counter, histogram};

pub mod names {
    /// Requests by operation and (equivalent) HTTP status.
    pub const REQUESTS_TOTAL: &str = "run_store_requests_total";

    pub const RETRIES_TOTAL: &str = "run_store_retries_total";

    /// Heartbeats and releases refused because the token no longer matched.
    pub const CAS_REJECTED_TOTAL: &str = "run_store_cas_rejected_total";

    pub const LATENCY_SECONDS: &str = "run_store_latency_seconds";
}

pub fn record_request(operation: &str, status: u16, latency_ms: f64) {
    let operation = operation.to_string();
    counter!(names::REQUESTS_TOTAL, "operation" => operation.clone(), "status" => status.to_string())
        .increment(1);
    histogram!(names::LATENCY_SECONDS, "operation" => operation).record(latency_ms / 1000.0);
}

pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

pub fn record_cas_rejected(operation: &str) {
    counter!(names::CAS_REJECTED_TOTAL, "operation" => operation.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_share_prefix() {
        for name in [
            names::REQUESTS_TOTAL,
            names::RETRIES_TOTAL,
            names::CAS_REJECTED_TOTAL,
            names::LATENCY_SECONDS,
        ] {
            assert!(name.starts_with("run_store_"), "{}", name);
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request("heartbeat", 200, 12.0);
        record_retry("claim_next");
        record_cas_rejected("release");
    }
}
