//! Payloads exchanged with the remote run store.
//!
//! Field names on the RPC requests follow the store's `p_`-prefixed
//! parameter convention so they can be posted as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{LockToken, PanicEvent, PanicReason, RunId, RunStatus, WorkerId};

/// `claim_next` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(rename = "p_worker_id")]
    pub worker_id: WorkerId,
    #[serde(rename = "p_lock_token")]
    pub lock_token: LockToken,
    #[serde(rename = "p_lease_minutes")]
    pub lease_minutes: u32,
    #[serde(rename = "p_task_type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
}

/// `heartbeat` parameters (compare-and-swap renewal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "p_run_id")]
    pub run_id: RunId,
    #[serde(rename = "p_worker_id")]
    pub worker_id: WorkerId,
    #[serde(rename = "p_lock_token")]
    pub lock_token: LockToken,
    #[serde(rename = "p_lease_minutes")]
    pub lease_minutes: u32,
    /// Latency of the previous heartbeat; absent on the first one.
    #[serde(rename = "p_latency_ms", default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// `release` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    #[serde(rename = "p_run_id")]
    pub run_id: RunId,
    #[serde(rename = "p_worker_id")]
    pub worker_id: WorkerId,
    #[serde(rename = "p_lock_token")]
    pub lock_token: LockToken,
}

/// Partial update of a run row. Only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages_completed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_reason: Option<PanicReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panicked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn done(stages_completed: Vec<String>) -> Self {
        Self {
            status: Some(RunStatus::Done),
            stages_completed: Some(stages_completed),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>, stages_completed: Vec<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error_message: Some(message.into()),
            stages_completed: Some(stages_completed),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn waiting_approval(stages_completed: Vec<String>) -> Self {
        Self {
            status: Some(RunStatus::WaitingApproval),
            stages_completed: Some(stages_completed),
            ..Default::default()
        }
    }

    /// Panic marking. Status is left alone so the run stays reclaimable
    /// once its lease lapses.
    pub fn panic(event: &PanicEvent) -> Self {
        Self {
            panic_reason: Some(event.reason_key),
            panic_event_id: Some(event.event_id),
            panicked_at: Some(event.timestamp),
            error_message: Some(event.message.clone()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Forensic event row. Idempotent on `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: Uuid,
    pub run_id: RunId,
    pub worker_id: WorkerId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl RunEvent {
    pub fn from_panic(event: &PanicEvent) -> Self {
        Self {
            event_id: event.event_id,
            run_id: event.run_id.clone(),
            worker_id: event.worker_id.clone(),
            event_type: event.reason_key.key().to_string(),
            payload: serde_json::json!({
                "message": event.message,
                "latency_ms": event.latency_ms,
                "retry_count": event.retry_count,
                "timestamp": event.timestamp,
            }),
            created_at: Utc::now(),
        }
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The row already existed; counts as accepted.
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_request_omits_missing_latency() {
        let req = HeartbeatRequest {
            run_id: RunId::from_string("r1"),
            worker_id: WorkerId::from_string("w1"),
            lock_token: LockToken::from_string("t"),
            lease_minutes: 15,
            latency_ms: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["p_run_id"], "r1");
        assert!(json.get("p_latency_ms").is_none());
    }

    #[test]
    fn test_panic_patch_keeps_status() {
        let event = PanicEvent::new(
            RunId::from_string("r1"),
            WorkerId::from_string("w1"),
            PanicReason::LostLock,
            "token mismatch",
        );
        let patch = RunPatch::panic(&event);
        assert!(patch.status.is_none());
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["panic_reason"], "panic_lost_lock");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_event_from_panic_uses_same_id() {
        let event = PanicEvent::new(
            RunId::from_string("r1"),
            WorkerId::from_string("w1"),
            PanicReason::HeartbeatUncertain,
            "3 failures",
        )
        .with_retry_count(3);
        let row = RunEvent::from_panic(&event);
        assert_eq!(row.event_id, event.event_id);
        assert_eq!(row.event_type, "panic_heartbeat_uncertain");
        assert_eq!(row.payload["retry_count"], 3);
    }
}
