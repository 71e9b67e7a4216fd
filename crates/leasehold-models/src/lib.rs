//! Shared data models for the leasehold worker.
//!
//! This crate provides Serde-serializable types for:
//! - Runs, run status and lease ownership credentials
//! - Per-run checkpoints
//! - Panic events and their reason keys
//! - Payloads exchanged with the remote run store

pub mod checkpoint;
pub mod panic;
pub mod rpc;
pub mod run;

// Re-export common types
pub use checkpoint::{Checkpoint, CheckpointTag};
pub use panic::{PanicEvent, PanicReason, Severity};
pub use rpc::{ClaimRequest, HeartbeatRequest, InsertOutcome, ReleaseRequest, RunEvent, RunPatch};
pub use run::{LeaseToken, LockToken, Run, RunId, RunStatus, WorkerId};
