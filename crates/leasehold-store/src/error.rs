//! Run store error types.

use thiserror::Error;

/// Result type for run store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Server error ({0}): {1}")]
    ServerError(u16, String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited, retry after {0}ms")]
    RateLimited(u64),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout(operation.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_http_status(status: u16, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match status {
            401 | 403 => Self::AuthError(msg),
            404 => Self::NotFound(msg),
            409 => Self::Conflict(msg),
            429 => Self::RateLimited(1000),
            500..=599 => Self::ServerError(status, msg),
            _ => Self::RequestFailed(msg),
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Network(_)
                | StoreError::Timeout(_)
                | StoreError::Unavailable(_)
                | StoreError::RateLimited(_)
                | StoreError::ServerError(_, _)
        )
    }

    /// True when the failure says nothing about the run itself, only that
    /// the store could not be reached or did not answer.
    pub fn is_transport(&self) -> bool {
        self.is_retryable()
    }

    /// HTTP status equivalent, for metrics.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            StoreError::AuthError(_) => Some(401),
            StoreError::NotFound(_) => Some(404),
            StoreError::Conflict(_) => Some(409),
            StoreError::RateLimited(_) => Some(429),
            StoreError::ServerError(status, _) => Some(*status),
            StoreError::RequestFailed(_) => Some(400),
            StoreError::Timeout(_) => Some(504),
            StoreError::Unavailable(_) => Some(503),
            StoreError::Network(e) => e.status().map(|s| s.as_u16()),
            StoreError::Config(_) | StoreError::InvalidResponse(_) | StoreError::Json(_) => None,
        }
    }

    /// Server-requested delay before retrying, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            StoreError::RateLimited(ms) => Some(*ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_http_status() {
        assert!(matches!(
            StoreError::from_http_status(429, "slow down"),
            StoreError::RateLimited(_)
        ));
        assert!(matches!(
            StoreError::from_http_status(503, "unavailable"),
            StoreError::ServerError(503, _)
        ));
        assert!(matches!(
            StoreError::from_http_status(409, "dup"),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            StoreError::from_http_status(400, "bad"),
            StoreError::RequestFailed(_)
        ));
        assert!(matches!(
            StoreError::from_http_status(403, "denied"),
            StoreError::AuthError(_)
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::from_http_status(500, "x").is_retryable());
        assert!(StoreError::timeout("heartbeat").is_retryable());
        assert!(StoreError::unavailable("partition").is_transport());
        assert!(!StoreError::from_http_status(400, "x").is_retryable());
        assert!(!StoreError::from_http_status(404, "x").is_retryable());
        assert!(!StoreError::from_http_status(409, "x").is_retryable());
    }

    #[test]
    fn test_http_status_getter() {
        assert_eq!(StoreError::RateLimited(1000).http_status(), Some(429));
        assert_eq!(
            StoreError::ServerError(502, "bad gateway".into()).http_status(),
            Some(502)
        );
        assert_eq!(StoreError::timeout("claim").http_status(), Some(504));
        assert_eq!(StoreError::RateLimited(5000).retry_after_ms(), Some(5000));
        assert_eq!(StoreError::NotFound("r".into()).retry_after_ms(), None);
    }
}
