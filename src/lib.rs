//! Session-scoped job orchestration.
//!
//! Maps each chat conversation session to at most one ephemeral compute job,
//! on a Kubernetes cluster or a local Docker daemon. See
//! [`orchestrator::AgentManager`] for the contract both backends implement.

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;

pub use config::{BackendKind, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{
    ActiveJobSummary, AgentManager, JobHandle, JobStatus, WorkerJobRequest, build_manager,
};
