//! Structured run logging utilities.
//!
//! Every line emitted while a run is in hand carries the same run id,
//! worker id and operation fields.

use tracing::{error, info, warn, Span};

use leasehold_models::{RunId, WorkerId};

/// Run logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
    worker_id: String,
    operation: String,
}

impl RunLogger {
    /// Create a new logger for a run handled by `worker_id`.
    ///
    /// # Arguments
    /// * `run_id` - The run being processed
    /// * `worker_id` - The worker holding the lease
    /// * `operation` - What is being done (e.g. "run", "spool_replay")
    pub fn new(run_id: &RunId, worker_id: &WorkerId, operation: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a run.
    pub fn log_start(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            worker_id = %self.worker_id,
            operation = %self.operation,
            "Run started: {}", message
        );
    }

    /// Log progress through a stage.
    pub fn log_stage(&self, stage: &str, message: &str) {
        info!(
            run_id = %self.run_id,
            worker_id = %self.worker_id,
            operation = %self.operation,
            stage = %stage,
            "Stage {}: {}", stage, message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            run_id = %self.run_id,
            worker_id = %self.worker_id,
            operation = %self.operation,
            "Run warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            run_id = %self.run_id,
            worker_id = %self.worker_id,
            operation = %self.operation,
            "Run error: {}", message
        );
    }

    /// Log how a run ended.
    pub fn log_completion(&self, outcome: &str, message: &str) {
        info!(
            run_id = %self.run_id,
            worker_id = %self.worker_id,
            operation = %self.operation,
            outcome = %outcome,
            "Run finished ({}): {}", outcome, message
        );
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Create a tracing span for this run.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "run",
            run_id = %self.run_id,
            worker_id = %self.worker_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_logger_fields() {
        let logger = RunLogger::new(
            &RunId::from_string("run-1"),
            &WorkerId::from_string("w1"),
            "run",
        );
        assert_eq!(logger.run_id(), "run-1");
        assert_eq!(logger.worker_id(), "w1");
    }
}
