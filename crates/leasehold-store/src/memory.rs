//! In-memory run store.
//!
//! Reference implementation of the store contract. Every operation is a
//! single critical section over the whole state, which is exactly the
//! atomicity a real backend must provide with one conditional UPDATE.
//!
//! Also carries a virtual clock and per-worker partition injection so
//! lease expiry and network splits can be simulated deterministically.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use leasehold_models::{
    ClaimRequest, HeartbeatRequest, InsertOutcome, ReleaseRequest, Run, RunEvent, RunId, RunPatch,
    RunStatus, WorkerId,
};

use crate::error::{StoreError, StoreResult};
use crate::store::RunStore;

/// A run row plus the bookkeeping columns the store maintains.
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub run: Run,
    pub seq: u64,
    pub error_message: Option<String>,
    pub last_patch: Option<RunPatch>,
    pub last_heartbeat_latency_ms: Option<u64>,
    pub heartbeat_count: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: BTreeMap<RunId, StoredRun>,
    events: BTreeMap<Uuid, RunEvent>,
    next_seq: u64,
    clock_offset_ms: i64,
    partitioned: HashSet<WorkerId>,
    partition_all: bool,
    refuse_patches: bool,
    heartbeat_attempts: u64,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.clock_offset_ms)
    }

    fn check_reachable(&self, worker_id: Option<&WorkerId>) -> StoreResult<()> {
        let cut = self.partition_all || worker_id.is_some_and(|w| self.partitioned.contains(w));
        if cut {
            return Err(StoreError::unavailable("simulated network partition"));
        }
        Ok(())
    }
}

/// In-memory [`RunStore`].
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-operation.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a queued run.
    pub fn enqueue(&self, run_id: impl Into<String>, task_type: Option<&str>) -> RunId {
        let mut state = self.lock();
        let run_id = RunId::from_string(run_id);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.runs.insert(
            run_id.clone(),
            StoredRun {
                run: Run {
                    run_id: run_id.clone(),
                    owner_worker_id: None,
                    lock_token: None,
                    lease_expires_at: None,
                    status: RunStatus::Queued,
                    stages_completed: Vec::new(),
                    task_type: task_type.map(str::to_string),
                },
                seq,
                error_message: None,
                last_patch: None,
                last_heartbeat_latency_ms: None,
                heartbeat_count: 0,
            },
        );
        run_id
    }

    /// Snapshot of a stored run.
    pub fn get(&self, run_id: &RunId) -> Option<StoredRun> {
        self.lock().runs.get(run_id).cloned()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.lock().events.values().cloned().collect()
    }

    /// Heartbeat calls received, including ones refused by a partition.
    pub fn heartbeat_attempts(&self) -> u64 {
        self.lock().heartbeat_attempts
    }

    /// Move the store's clock forward.
    pub fn advance_clock(&self, by: std::time::Duration) {
        let by_ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        let mut state = self.lock();
        state.clock_offset_ms = state.clock_offset_ms.saturating_add(by_ms);
    }

    /// Cut `worker_id` off from the store.
    pub fn partition(&self, worker_id: &WorkerId) {
        self.lock().partitioned.insert(worker_id.clone());
    }

    pub fn heal(&self, worker_id: &WorkerId) {
        self.lock().partitioned.remove(worker_id);
    }

    /// Make the store unreachable for everyone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().partition_all = unavailable;
    }

    /// Fail status patches while every other call keeps working.
    pub fn refuse_patches(&self, refuse: bool) {
        self.lock().refuse_patches = refuse;
    }

    /// Force a status change, as an operator would.
    pub fn set_status(&self, run_id: &RunId, status: RunStatus) {
        if let Some(stored) = self.lock().runs.get_mut(run_id) {
            stored.run.status = status;
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn claim_next(&self, req: &ClaimRequest) -> StoreResult<Option<RunId>> {
        let mut state = self.lock();
        state.check_reachable(Some(&req.worker_id))?;
        let now = state.now();
        let lease_until = now + Duration::minutes(i64::from(req.lease_minutes));

        // Recovery first: the worker's own running run wins.
        let own = state
            .runs
            .values()
            .filter(|s| {
                s.run.status == RunStatus::Running
                    && s.run.owner_worker_id.as_ref() == Some(&req.worker_id)
            })
            .min_by_key(|s| s.seq)
            .map(|s| s.run.run_id.clone());

        let candidate = own.or_else(|| {
            state
                .runs
                .values()
                .filter(|s| match s.run.status {
                    RunStatus::Queued => true,
                    RunStatus::Running => s.run.lease_expired(now),
                    _ => false,
                })
                .filter(|s| match &req.task_type {
                    Some(t) => s.run.task_type.as_deref() == Some(t.as_str()),
                    None => true,
                })
                .min_by_key(|s| s.seq)
                .map(|s| s.run.run_id.clone())
        });

        let Some(run_id) = candidate else {
            return Ok(None);
        };

        if let Some(stored) = state.runs.get_mut(&run_id) {
            stored.run.owner_worker_id = Some(req.worker_id.clone());
            stored.run.lock_token = Some(req.lock_token.clone());
            stored.run.lease_expires_at = Some(lease_until);
            stored.run.status = RunStatus::Running;
        }
        debug!(run_id = %run_id, worker_id = %req.worker_id, "Claimed run");
        Ok(Some(run_id))
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> StoreResult<bool> {
        let mut state = self.lock();
        state.heartbeat_attempts += 1;
        state.check_reachable(Some(&req.worker_id))?;
        let lease_until = state.now() + Duration::minutes(i64::from(req.lease_minutes));

        let Some(stored) = state.runs.get_mut(&req.run_id) else {
            return Ok(false);
        };
        let owns = stored.run.status == RunStatus::Running
            && stored.run.lock_token.as_ref() == Some(&req.lock_token)
            && stored.run.owner_worker_id.as_ref() == Some(&req.worker_id);
        if !owns {
            return Ok(false);
        }

        stored.run.lease_expires_at = Some(lease_until);
        stored.heartbeat_count += 1;
        if req.latency_ms.is_some() {
            stored.last_heartbeat_latency_ms = req.latency_ms;
        }
        Ok(true)
    }

    async fn release(&self, req: &ReleaseRequest) -> StoreResult<bool> {
        let mut state = self.lock();
        state.check_reachable(Some(&req.worker_id))?;

        let Some(stored) = state.runs.get_mut(&req.run_id) else {
            return Ok(false);
        };
        let owns = stored.run.lock_token.as_ref() == Some(&req.lock_token)
            && stored.run.owner_worker_id.as_ref() == Some(&req.worker_id);
        if !owns {
            return Ok(false);
        }

        stored.run.owner_worker_id = None;
        stored.run.lock_token = None;
        stored.run.lease_expires_at = None;
        if stored.run.status == RunStatus::Running {
            stored.run.status = RunStatus::Queued;
        }
        Ok(true)
    }

    async fn patch_run_status(&self, run_id: &RunId, patch: &RunPatch) -> StoreResult<()> {
        let mut state = self.lock();
        state.check_reachable(None)?;
        if state.refuse_patches {
            return Err(StoreError::unavailable("status patch refused"));
        }

        let stored = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

        if let Some(status) = patch.status {
            stored.run.status = status;
        }
        if let Some(stages) = &patch.stages_completed {
            stored.run.stages_completed = stages.clone();
        }
        if let Some(message) = &patch.error_message {
            stored.error_message = Some(message.clone());
        }
        stored.last_patch = Some(patch.clone());
        Ok(())
    }

    async fn insert_event(&self, event: &RunEvent) -> StoreResult<InsertOutcome> {
        let mut state = self.lock();
        state.check_reachable(Some(&event.worker_id))?;

        if state.events.contains_key(&event.event_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.events.insert(event.event_id, event.clone());
        Ok(InsertOutcome::Inserted)
    }
}
