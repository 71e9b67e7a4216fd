//! Command-line surface of the worker binary.

use std::path::PathBuf;

use clap::Parser;

use leasehold_models::WorkerId;

use crate::config::WorkerConfig;

#[derive(Parser, Debug, Default)]
#[command(name = "leasehold-worker")]
#[command(about = "Claims runs from the shared queue and executes their stages", long_about = None)]
pub struct Cli {
    /// Worker identifier (overrides WORKER_ID)
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Lease duration in minutes (overrides WORKER_LEASE_MINUTES)
    #[arg(long)]
    pub lease_minutes: Option<u32>,

    /// Seconds to wait between claims when idle
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Directory holding checkpoints and the panic spool
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Only claim runs of this task type
    #[arg(long)]
    pub task_type: Option<String>,

    /// Process at most one run, then exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Layer flags on top of the environment configuration.
    pub fn apply(&self, config: &mut WorkerConfig) {
        if let Some(id) = &self.worker_id {
            config.worker_id = WorkerId::from_string(id.clone());
        }
        if let Some(minutes) = self.lease_minutes {
            config.lease_minutes = minutes;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(task_type) = &self.task_type {
            config.task_type = Some(task_type.clone());
        }
    }
}
