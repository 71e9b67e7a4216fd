//! Per-run progress checkpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LockToken, RunId};

/// Why a checkpoint was left behind without the run finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTag {
    /// Shutdown was requested between stages
    Interrupted,
    /// Lease ownership could no longer be trusted
    Panic,
    /// A stage failed but the run can be resumed later
    Failed,
    /// A stage is waiting on an external approval
    AwaitingApproval,
}

/// Durable local record of which stages of a run have completed.
///
/// `completed_stages` is append-only: stages are never removed once
/// recorded, and recording a stage twice is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub current_stage: Option<String>,
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Output data keyed by the stage that produced it
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    pub lock_token: Option<LockToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<CheckpointTag>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Empty checkpoint for a run that has not executed any stage yet.
    pub fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            current_stage: None,
            completed_stages: Vec::new(),
            data: BTreeMap::new(),
            lock_token: None,
            tag: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_stage.is_none() && self.completed_stages.is_empty()
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    /// Record `stage` as completed. Returns false if it already was.
    pub fn mark_completed(&mut self, stage: &str) -> bool {
        self.current_stage = Some(stage.to_string());
        self.updated_at = Utc::now();
        if self.is_completed(stage) {
            return false;
        }
        self.completed_stages.push(stage.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_completed_is_idempotent() {
        let mut cp = Checkpoint::empty(RunId::from_string("r1"));
        assert!(cp.is_empty());
        assert!(cp.mark_completed("a"));
        assert!(cp.mark_completed("b"));
        assert!(!cp.mark_completed("a"));
        assert_eq!(cp.completed_stages, vec!["a", "b"]);
        assert_eq!(cp.current_stage.as_deref(), Some("a"));
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let json = r#"{"run_id":"r1","current_stage":null,"lock_token":null,"updated_at":"2026-01-01T00:00:00Z"}"#;
        let cp: Checkpoint = serde_json::from_str(json).unwrap();
        assert!(cp.completed_stages.is_empty());
        assert!(cp.data.is_empty());
        assert!(cp.tag.is_none());
    }
}
