//! Error types for the job orchestration engine.

use std::time::Duration;

/// Errors surfaced by an [`AgentManager`](crate::orchestrator::AgentManager).
///
/// Only creation and construction can fail synchronously. Status reads degrade
/// to [`JobStatus::Unknown`](crate::orchestrator::JobStatus::Unknown) and
/// deletions are logged, so neither has a variant here.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The acting user exhausted their job budget for the current window.
    #[error("Rate limit exceeded for actor {actor_id}, retry in {retry_after:?}")]
    RateLimitExceeded {
        actor_id: String,
        retry_after: Duration,
    },

    /// The backend rejected or failed to run the job spec.
    #[error("Job creation failed during {operation} for session {session_key}: {reason}")]
    JobCreationFailed {
        session_key: String,
        operation: &'static str,
        reason: String,
    },

    /// The backend could not be reached while building the manager.
    #[error("Backend unavailable: {reason}")]
    Backend { reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Whether the caller should tell the user to try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the Kubernetes API server.
#[derive(Debug, thiserror::Error)]
pub enum ClusterApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Job {name} not found")]
    NotFound { name: String },

    #[error("Failed to decode API response: {reason}")]
    Decode { reason: String },

    #[error("Cluster credentials unavailable: {reason}")]
    Credentials { reason: String },
}

/// Errors from the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker not available: {reason}")]
    Unavailable { reason: String },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container {id} not found")]
    NotFound { id: String },

    #[error("Container wait failed: {reason}")]
    WaitFailed { reason: String },
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rate_limit_is_retryable() {
        let limited = OrchestratorError::RateLimitExceeded {
            actor_id: "U1".to_string(),
            retry_after: Duration::from_secs(30),
        };
        assert!(limited.is_retryable());

        let failed = OrchestratorError::JobCreationFailed {
            session_key: "C1:1700000000.0001".to_string(),
            operation: "submit",
            reason: "quota exceeded".to_string(),
        };
        assert!(!failed.is_retryable());
        let msg = failed.to_string();
        assert!(msg.contains("submit"));
        assert!(msg.contains("C1:1700000000.0001"));
        assert!(msg.contains("quota exceeded"));
    }
}
