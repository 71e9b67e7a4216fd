//! Lease-holding run worker.
//!
//! This crate provides:
//! - Exclusive run claiming with recovery-first semantics
//! - Background CAS heartbeats with lost/uncertain detection
//! - Durable local checkpoints for idempotent resumption
//! - Local-first panic reporting with spool replay and quarantine
//! - The worker loop composing all of the above

pub mod checkpoint;
pub mod claimer;
pub mod cli;
pub mod config;
pub mod error;
pub mod fs_utils;
pub mod heartbeat;
pub mod logging;
pub mod metrics;
pub mod panic;
pub mod stage;
pub mod worker_loop;


pub use checkpoint::CheckpointStore;
pub use claimer::RunClaimer;
pub use cli::Cli;
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use heartbeat::{HeartbeatConfig, HeartbeatHandle, LeaseHeartbeat, LeaseState, OwnershipLoss};
pub use logging::RunLogger;
pub use panic::{
    DeliveryOutcome, LogNotifier, Notifier, PanicReport, PanicReporter, PanicSpool, ReplaySummary,
    WebhookNotifier,
};
pub use stage::{CancelSignal, StageContext, StageError, StageOutcome, StageRunner, StubStageRunner};
pub use worker_loop::{RunOutcome, WorkerLoop};
