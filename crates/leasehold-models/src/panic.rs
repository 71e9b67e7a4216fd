//! Panic events: a worker's declaration that it can no longer trust its
//! ownership of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{RunId, WorkerId};

/// Reason a worker stopped trusting its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanicReason {
    /// The store rejected the lock token (mismatch or terminal run).
    #[serde(rename = "panic_lost_lock")]
    LostLock,
    /// Too many consecutive heartbeat transport failures.
    #[serde(rename = "panic_heartbeat_uncertain")]
    HeartbeatUncertain,
}

impl PanicReason {
    /// Stable key used in events, metrics and alerts.
    pub fn key(&self) -> &'static str {
        match self {
            PanicReason::LostLock => "panic_lost_lock",
            PanicReason::HeartbeatUncertain => "panic_heartbeat_uncertain",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PanicReason::LostLock => Severity::Critical,
            PanicReason::HeartbeatUncertain => Severity::Warning,
        }
    }

    /// Concrete next step for the operator receiving the alert.
    pub fn recommended_action(&self) -> &'static str {
        match self {
            PanicReason::LostLock => {
                "another worker now owns this run; check for duplicate worker ids \
                 and confirm the current owner in the run store"
            }
            PanicReason::HeartbeatUncertain => {
                "check connectivity from the worker host to the run store; \
                 the lease expires on its own and the run will be reclaimed"
            }
        }
    }
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// A panic, spooled locally before any network call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanicEvent {
    /// Globally unique; makes remote delivery idempotent across replays.
    pub event_id: Uuid,
    pub run_id: RunId,
    pub worker_id: WorkerId,
    pub reason_key: PanicReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl PanicEvent {
    pub fn new(
        run_id: RunId,
        worker_id: WorkerId,
        reason: PanicReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id,
            worker_id,
            reason_key: reason,
            message: message.into(),
            latency_ms: None,
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_latency(mut self, latency_ms: Option<u64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_keys_match_serde() {
        for reason in [PanicReason::LostLock, PanicReason::HeartbeatUncertain] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.key()));
        }
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = PanicEvent::new(
            RunId::from_string("r"),
            WorkerId::from_string("w"),
            PanicReason::LostLock,
            "x",
        );
        let b = PanicEvent::new(
            RunId::from_string("r"),
            WorkerId::from_string("w"),
            PanicReason::LostLock,
            "x",
        );
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_latency_omitted_when_absent() {
        let event = PanicEvent::new(
            RunId::from_string("r"),
            WorkerId::from_string("w"),
            PanicReason::HeartbeatUncertain,
            "x",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("latency_ms").is_none());
        assert_eq!(json["reason_key"], "panic_heartbeat_uncertain");
    }
}
