//! Session-scoped job orchestration.
//!
//! An [`AgentManager`] maps each conversation session to at most one live
//! job on a compute backend:
//!
//! ```text
//!   WorkerJobRequest
//!         │
//!         ▼
//!   ┌─────────────┐  deny   ┌───────────────────┐
//!   │ RateLimiter │────────▶│ RateLimitExceeded │
//!   └─────────────┘         └───────────────────┘
//!         │ admit
//!         ▼
//!   ┌─────────────┐ tracked ┌───────────────────┐
//!   │ JobTracker  │────────▶│ existing handle   │
//!   └─────────────┘         └───────────────────┘
//!         │ reserved
//!         ▼
//!   ┌─────────────┐         ┌───────────────────┐
//!   │  Backend    │────────▶│ monitor task      │──▶ remove after grace
//!   │ cluster/    │         └───────────────────┘
//!   │ runtime     │
//!   └─────────────┘
//! ```

pub mod cluster;
pub mod env;
pub mod naming;
pub mod rate_limit;
pub mod runtime;
pub(crate) mod tracker;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::cluster::{ClusterJobManager, KubeClient};
use crate::orchestrator::rate_limit::RateLimiter;
use crate::orchestrator::runtime::{DockerRuntime, RuntimeJobManager};
use crate::orchestrator::tracker::{JobTracker, Reservation, SlotGuard};

/// Per-job execution overrides forwarded to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Model override (e.g. "sonnet").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Tool patterns the worker may use. Empty means the worker default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

/// A request to run one job for a conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJobRequest {
    /// Stable for every event of one conversation thread.
    pub session_key: String,
    /// Acting user. Absent ids share one rate limit bucket.
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
    pub channel_ref: String,
    pub thread_ref: String,
    pub task_payload: String,
    #[serde(default)]
    pub repository_ref: Option<String>,
    /// Where the worker posts its results.
    pub response_target: String,
    #[serde(default)]
    pub execution_options: ExecutionOptions,
    #[serde(default)]
    pub conversation_history: Option<String>,
}

/// Backend identifier of one job: a Kubernetes job name or a container id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-neutral job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The backend could not be asked.
    Unknown,
}

impl JobStatus {
    /// Succeeded and failed jobs never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry of [`AgentManager::list_active`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveJobSummary {
    pub handle: JobHandle,
    pub session_key: String,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
}

/// Backend-polymorphic job orchestration contract.
#[async_trait]
pub trait AgentManager: Send + Sync {
    /// Which backend this manager drives.
    fn backend(&self) -> BackendKind;

    /// Create the job for `request.session_key`, or return the one already
    /// tracked for it.
    async fn create_job(&self, request: &WorkerJobRequest) -> Result<JobHandle>;

    /// Stop and remove a job. Failures are logged, never returned.
    async fn delete_job(&self, handle: &JobHandle);

    /// Current status; backend failures degrade to [`JobStatus::Unknown`].
    async fn get_status(&self, handle: &JobHandle) -> JobStatus;

    /// Every tracked job with a freshly read status.
    async fn list_active(&self) -> Vec<ActiveJobSummary>;

    /// Number of tracked sessions, in-flight creations included.
    fn active_count(&self) -> usize;

    /// Best-effort delete of every tracked job, then forget them all.
    async fn cleanup(&self);
}

/// Outcome of admission and reservation for a creation request.
pub(crate) enum Claim {
    Existing(JobHandle),
    Reserved(SlotGuard),
}

/// Admit the actor, then claim the session slot without suspending in between.
pub(crate) async fn claim_session(
    limiter: &RateLimiter,
    tracker: &Arc<JobTracker>,
    request: &WorkerJobRequest,
) -> Result<Claim> {
    limiter.check(request.actor_id.as_deref())?;

    match tracker.reserve(&request.session_key) {
        Reservation::Existing(handle) => {
            tracing::debug!(
                session_key = %request.session_key,
                handle = %handle,
                "Session already has a job"
            );
            Ok(Claim::Existing(handle))
        }
        Reservation::InFlight(waiter) => {
            tracing::debug!(
                session_key = %request.session_key,
                "Waiting for concurrent job creation"
            );
            waiter.wait().await.map(Claim::Existing)
        }
        Reservation::Reserved(guard) => Ok(Claim::Reserved(guard)),
    }
}

/// Build the manager selected by `config.backend`, connecting to the backend.
pub async fn build_manager(config: OrchestratorConfig) -> Result<Arc<dyn AgentManager>> {
    match config.backend {
        BackendKind::Cluster => {
            let client = KubeClient::from_config(&config.cluster).map_err(|e| {
                OrchestratorError::Backend {
                    reason: e.to_string(),
                }
            })?;
            let manager = ClusterJobManager::new(config, Arc::new(client)).await;
            Ok(Arc::new(manager))
        }
        BackendKind::Runtime => {
            let runtime = DockerRuntime::connect(&config.runtime)
                .await
                .map_err(|e| OrchestratorError::Backend {
                    reason: e.to_string(),
                })?;
            let manager = RuntimeJobManager::new(config, Arc::new(runtime));
            Ok(Arc::new(manager))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_request_deserializes_with_defaults() {
        let raw = r#"{
            "session_key": "C1:1700000000.0001",
            "channel_ref": "C1",
            "thread_ref": "1700000000.0001",
            "task_payload": "fix the flaky test",
            "response_target": "https://hooks.example.com/T1"
        }"#;
        let request: WorkerJobRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.actor_id, None);
        assert_eq!(request.display_name, "");
        assert_eq!(request.execution_options, ExecutionOptions::default());
        assert_eq!(request.conversation_history, None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
        assert_eq!(JobStatus::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_handle_serializes_as_string() {
        let handle = JobHandle::from("sj-c1-abc");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"sj-c1-abc\"");
    }
}
