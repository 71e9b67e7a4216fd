//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use leasehold_models::WorkerId;
use leasehold_store::RetryConfig;

use crate::error::{WorkerError, WorkerResult};
use crate::heartbeat::HeartbeatConfig;

/// The lease must outlast this many heartbeat periods.
const MIN_LEASE_HEARTBEAT_RATIO: u32 = 5;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity presented to the run store
    pub worker_id: WorkerId,
    /// Lease duration requested on claim and every renewal
    pub lease_minutes: u32,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Base heartbeat interval
    pub heartbeat_interval: Duration,
    /// Upper bound of the random delay added to each heartbeat
    pub heartbeat_jitter: Duration,
    /// Consecutive transport failures before ownership is uncertain
    pub heartbeat_failure_threshold: u32,
    /// Delay before re-trying a heartbeat after a transport failure
    pub heartbeat_backoff: Duration,
    /// Per-call timeout for every store RPC
    pub rpc_timeout: Duration,
    /// How long to wait for the heartbeat task to stop
    pub heartbeat_stop_grace: Duration,
    /// Pause after a panic before claiming new work
    pub panic_quarantine: Duration,
    /// Root for checkpoints and the panic spool
    pub state_dir: PathBuf,
    /// Only claim runs of this type
    pub task_type: Option<String>,
    /// Replay attempts before a spool record is quarantined
    pub spool_max_attempts: u32,
    /// Minimum time between spool replays while idle
    pub spool_replay_interval: Duration,
    /// Character budget for failure messages written to the store
    pub failure_message_max_chars: usize,
    /// Character budget for operator alerts
    pub alert_max_chars: usize,
    /// Webhook receiving operator alerts
    pub alert_webhook_url: Option<String>,
    /// Stage names for the stub pipeline
    pub stages: Vec<String>,
    /// Prometheus listener address
    pub metrics_addr: Option<String>,
    /// Retry policy for claim, release and status writes
    pub store_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            lease_minutes: 15,
            poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(120),
            heartbeat_jitter: Duration::from_secs(15),
            heartbeat_failure_threshold: 3,
            heartbeat_backoff: Duration::from_millis(5000),
            rpc_timeout: Duration::from_secs(10),
            heartbeat_stop_grace: Duration::from_secs(5),
            panic_quarantine: Duration::from_secs(45),
            state_dir: PathBuf::from("/tmp/leasehold"),
            task_type: None,
            spool_max_attempts: 5,
            spool_replay_interval: Duration::from_secs(300),
            failure_message_max_chars: 500,
            alert_max_chars: 4000,
            alert_webhook_url: None,
            stages: default_stages(),
            metrics_addr: None,
            store_retry: RetryConfig::default(),
        }
    }
}

fn default_stages() -> Vec<String> {
    ["research", "prompt", "image", "audio", "publish"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            worker_id: env_opt("WORKER_ID")
                .map(WorkerId::from_string)
                .unwrap_or(defaults.worker_id),
            lease_minutes: env_or("WORKER_LEASE_MINUTES", defaults.lease_minutes),
            poll_interval: Duration::from_secs(env_or("WORKER_POLL_INTERVAL_SECS", 10)),
            heartbeat_interval: Duration::from_secs(env_or("WORKER_HEARTBEAT_SECS", 120)),
            heartbeat_jitter: Duration::from_secs(env_or("WORKER_HEARTBEAT_JITTER_SECS", 15)),
            heartbeat_failure_threshold: env_or(
                "WORKER_HEARTBEAT_FAILURE_THRESHOLD",
                defaults.heartbeat_failure_threshold,
            ),
            heartbeat_backoff: Duration::from_millis(env_or("WORKER_HEARTBEAT_BACKOFF_MS", 5000)),
            rpc_timeout: Duration::from_secs(env_or("WORKER_RPC_TIMEOUT_SECS", 10)),
            heartbeat_stop_grace: Duration::from_secs(env_or(
                "WORKER_HEARTBEAT_STOP_GRACE_SECS",
                5,
            )),
            panic_quarantine: Duration::from_secs(env_or("WORKER_PANIC_QUARANTINE_SECS", 45)),
            state_dir: env_opt("WORKER_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            task_type: env_opt("WORKER_TASK_TYPE"),
            spool_max_attempts: env_or("WORKER_SPOOL_MAX_ATTEMPTS", defaults.spool_max_attempts),
            spool_replay_interval: Duration::from_secs(env_or("WORKER_SPOOL_REPLAY_SECS", 300)),
            failure_message_max_chars: env_or(
                "WORKER_FAILURE_MESSAGE_MAX_CHARS",
                defaults.failure_message_max_chars,
            ),
            alert_max_chars: env_or("ALERT_MAX_CHARS", defaults.alert_max_chars),
            alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
            stages: env_opt("WORKER_STAGES")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.stages),
            metrics_addr: env_opt("METRICS_ADDR"),
            store_retry: RetryConfig::from_env(),
        }
    }

    /// Reject settings that would let a lease expire under a healthy worker.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.lease_minutes == 0 {
            return Err(WorkerError::config_error("lease_minutes must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerError::config_error(
                "heartbeat interval must be positive",
            ));
        }
        if self.heartbeat_failure_threshold == 0 {
            return Err(WorkerError::config_error(
                "heartbeat failure threshold must be at least 1",
            ));
        }
        if self.spool_max_attempts == 0 {
            return Err(WorkerError::config_error(
                "spool max attempts must be at least 1",
            ));
        }

        let lease = self.lease_duration();
        let period = self.heartbeat_interval + self.heartbeat_jitter;
        if lease < period * MIN_LEASE_HEARTBEAT_RATIO {
            return Err(WorkerError::config_error(format!(
                "lease of {}s must be at least {}x the heartbeat period of {}s",
                lease.as_secs(),
                MIN_LEASE_HEARTBEAT_RATIO,
                period.as_secs()
            )));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_minutes) * 60)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.state_dir.join("spool")
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval,
            jitter: self.heartbeat_jitter,
            failure_threshold: self.heartbeat_failure_threshold,
            failure_backoff: self.heartbeat_backoff,
            rpc_timeout: self.rpc_timeout,
            lease_minutes: self.lease_minutes,
        }
    }
}
