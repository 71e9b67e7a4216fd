//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Checkpoint could not be read or written.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Panic spool could not be written. Always fatal to the caller.
    #[error("Spool error: {0}")]
    Spool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn spool(msg: impl Into<String>) -> Self {
        Self::Spool(msg.into())
    }

    /// A local durability failure: state the worker believes it persisted
    /// was not actually persisted.
    pub fn is_durability(&self) -> bool {
        matches!(
            self,
            WorkerError::Checkpoint(_) | WorkerError::Spool(_) | WorkerError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durability_classification() {
        assert!(WorkerError::spool("disk full").is_durability());
        assert!(WorkerError::checkpoint("rename failed").is_durability());
        assert!(!WorkerError::config_error("bad lease").is_durability());
    }

    #[test]
    fn test_io_and_json_errors_convert() {
        let io = std::io::Error::other("no space left");
        let err: WorkerError = io.into();
        assert!(err.is_durability());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: WorkerError = json.into();
        assert!(!err.is_durability());
        assert!(err.to_string().starts_with("JSON error"));
    }
}
