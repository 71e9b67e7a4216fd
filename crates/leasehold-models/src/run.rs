//! Run definitions and lease ownership credentials.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a run in the shared queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `n` characters of the id, for compact operator messages.
    pub fn suffix(&self, n: usize) -> &str {
        let count = self.0.chars().count();
        if count <= n {
            return &self.0;
        }
        let skip = count - n;
        let start = self
            .0
            .char_indices()
            .nth(skip)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.0[start..]
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Generate a new random worker ID.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque credential proving current lease ownership.
///
/// A fresh token is minted for every claim, so a worker that lost and
/// regained connectivity cannot act on an ownership it no longer holds.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(pub String);

impl LockToken {
    /// Mint a new random lock token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of debug logs.
impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "LockToken({}…)", prefix)
    }
}

/// The (run_id, lock_token) pair presented on every heartbeat and release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub run_id: RunId,
    pub lock_token: LockToken,
}

impl LeaseToken {
    pub fn new(run_id: RunId, lock_token: LockToken) -> Self {
        Self { run_id, lock_token }
    }
}

/// Run status in the shared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is waiting for a worker
    #[default]
    Queued,
    /// Run is owned by a worker holding a valid lease
    Running,
    /// Run is paused on an external approval
    WaitingApproval,
    /// Run completed successfully
    Done,
    /// Run failed with an unrecoverable stage error
    Failed,
    /// Run was aborted by an operator
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    /// Check if this is a terminal state (no lease may be renewed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work in the shared queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub owner_worker_id: Option<WorkerId>,
    pub lock_token: Option<LockToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub stages_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
}

impl Run {
    /// A run freshly claimed by `worker_id` with the given token and lease.
    pub fn claimed(
        run_id: RunId,
        worker_id: WorkerId,
        lock_token: LockToken,
        lease_minutes: u32,
    ) -> Self {
        Self {
            run_id,
            owner_worker_id: Some(worker_id),
            lock_token: Some(lock_token),
            lease_expires_at: Some(Utc::now() + Duration::minutes(i64::from(lease_minutes))),
            status: RunStatus::Running,
            stages_completed: Vec::new(),
            task_type: None,
        }
    }

    /// The lease credential for this run, if it is currently owned.
    pub fn lease_token(&self) -> Option<LeaseToken> {
        self.lock_token
            .as_ref()
            .map(|token| LeaseToken::new(self.run_id.clone(), token.clone()))
    }

    /// Check whether the lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(expires_at) => expires_at <= now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&RunStatus::WaitingApproval).unwrap();
        assert_eq!(json, "\"waiting_approval\"");
    }

    #[test]
    fn test_run_id_suffix() {
        let id = RunId::from_string("run-0123456789abcdef");
        assert_eq!(id.suffix(8), "89abcdef");
        assert_eq!(RunId::from_string("abc").suffix(8), "abc");
    }

    #[test]
    fn test_lock_token_debug_is_redacted() {
        let token = LockToken::from_string("0123456789abcdef-secret");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("secret"));
        assert!(debug.starts_with("LockToken(01234567"));
    }

    #[test]
    fn test_claimed_run_has_lease() {
        let run = Run::claimed(
            RunId::from_string("r1"),
            WorkerId::from_string("w1"),
            LockToken::generate(),
            15,
        );
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.lease_expired(Utc::now()));
        assert!(run.lease_expired(Utc::now() + Duration::minutes(16)));
        assert_eq!(run.lease_token().unwrap().run_id, run.run_id);
    }
}
