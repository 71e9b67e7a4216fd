//! The remote run store contract.

use async_trait::async_trait;

use leasehold_models::{
    ClaimRequest, HeartbeatRequest, InsertOutcome, ReleaseRequest, RunEvent, RunId, RunPatch,
};

use crate::error::StoreResult;

/// Backing store for runs, shared by every worker process.
///
/// All ownership decisions are made here through single atomic
/// conditional updates. Workers never coordinate with each other directly.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Claim a run for `req.worker_id`, storing `req.lock_token` as the new
    /// ownership credential.
    ///
    /// A run already owned by the same worker wins over unclaimed work, so a
    /// restarted worker resumes its own abandoned run. Returns `None` when
    /// there is nothing to do.
    async fn claim_next(&self, req: &ClaimRequest) -> StoreResult<Option<RunId>>;

    /// Compare-and-swap lease renewal.
    ///
    /// `Ok(false)` is a definitive answer: the token no longer matches or the
    /// run reached a terminal state. Transport problems are `Err`.
    async fn heartbeat(&self, req: &HeartbeatRequest) -> StoreResult<bool>;

    /// Give up ownership. Succeeds only on token match.
    async fn release(&self, req: &ReleaseRequest) -> StoreResult<bool>;

    /// Update run fields (terminal status, panic marking).
    async fn patch_run_status(&self, run_id: &RunId, patch: &RunPatch) -> StoreResult<()>;

    /// Append a forensic event row. A duplicate `event_id` is accepted.
    async fn insert_event(&self, event: &RunEvent) -> StoreResult<InsertOutcome>;
}
