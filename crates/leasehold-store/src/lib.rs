//! Remote run store access for lease-holding workers.
//!
//! This crate provides:
//! - The [`RunStore`] contract: claim, CAS heartbeat, release, patch, events
//! - [`HttpRunStore`], an RPC-over-HTTP client with tracing and metrics
//! - [`MemoryRunStore`], an in-process implementation with fault injection
//! - Retry with exponential backoff and jitter

pub mod client;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod store;


pub use client::{HttpRunStore, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryRunStore, StoredRun};
pub use retry::{with_retry, RetryConfig};
pub use store::RunStore;
