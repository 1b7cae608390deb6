//! Docker-backed [`AgentManager`].
//!
//! Containers are started with auto-remove and watched with a blocking
//! wait-for-exit, one task per container. Docker has no run deadline, so the
//! job timeout travels to the worker as `JOB_TIMEOUT_SECS` and the worker
//! exits on its own. Nothing is recovered after a restart: containers started
//! by a previous process keep running untracked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::task::JoinHandle;

use crate::config::{BackendKind, MonitorConfig, OrchestratorConfig};
use crate::error::{OrchestratorError, Result, RuntimeError};
use crate::orchestrator::cluster::manifest::{
    ANNOTATION_CREATED_AT, ANNOTATION_DISPLAY_NAME, COMPONENT_WORKER, LABEL_ACTOR_ID, LABEL_APP,
    LABEL_COMPONENT, LABEL_SESSION_KEY,
};
use crate::orchestrator::env::{self, worker_env};
use crate::orchestrator::naming::job_name;
use crate::orchestrator::rate_limit::{RateLimiter, actor_key};
use crate::orchestrator::runtime::api::{ContainerRuntime, ContainerSpec};
use crate::orchestrator::runtime::units::{parse_cpu, parse_memory};
use crate::orchestrator::tracker::{ActiveJob, JobTracker, SUPERSEDED};
use crate::orchestrator::{
    ActiveJobSummary, AgentManager, Claim, JobHandle, JobStatus, WorkerJobRequest, claim_session,
};

pub struct RuntimeJobManager {
    config: OrchestratorConfig,
    runtime: Arc<dyn ContainerRuntime>,
    tracker: Arc<JobTracker>,
    limiter: Arc<RateLimiter>,
    /// Host values of `config.runtime.passthrough_env`, read once.
    host_env: Vec<(String, String)>,
    sweeper: JoinHandle<()>,
}

impl RuntimeJobManager {
    pub fn new(config: OrchestratorConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let host_env = config
            .runtime
            .passthrough_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let sweeper = limiter.spawn_sweeper();
        Self {
            config,
            runtime,
            tracker: JobTracker::new(),
            limiter,
            host_env,
            sweeper,
        }
    }

    /// Replace the host values copied into every container.
    pub fn with_host_env(mut self, host_env: Vec<(String, String)>) -> Self {
        self.host_env = host_env;
        self
    }

    fn container_spec(
        &self,
        name: &str,
        actor_id: &str,
        request: &WorkerJobRequest,
    ) -> ContainerSpec {
        let mut env: Vec<String> = worker_env(name, actor_id, request)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!(
            "{}={}",
            env::JOB_TIMEOUT_SECS,
            self.config.job_timeout.as_secs()
        ));
        env.extend(self.host_env.iter().map(|(k, v)| format!("{}={}", k, v)));

        // Docker labels take any string, so values are stored verbatim
        let labels: HashMap<String, String> = [
            (LABEL_APP, self.config.cluster.app_label.clone()),
            (LABEL_SESSION_KEY, request.session_key.clone()),
            (LABEL_ACTOR_ID, actor_id.to_string()),
            (LABEL_COMPONENT, COMPONENT_WORKER.to_string()),
            (ANNOTATION_DISPLAY_NAME, request.display_name.clone()),
            (
                ANNOTATION_CREATED_AT,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let runtime = &self.config.runtime;
        ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            env,
            labels,
            binds: runtime.host_mount.iter().map(|m| m.to_bind()).collect(),
            memory_bytes: parse_memory(&self.config.resources.memory_limit),
            cpu_shares: parse_cpu(&self.config.resources.cpu_limit),
            network: runtime.network.clone(),
            auto_remove: true,
        }
    }

    fn spawn_monitor(&self, session_key: &str, handle: &JobHandle) {
        let task = tokio::spawn(wait_job(
            Arc::clone(&self.runtime),
            Arc::clone(&self.tracker),
            self.config.monitor.clone(),
            self.config.job_timeout,
            session_key.to_string(),
            handle.clone(),
        ));
        self.tracker
            .attach_monitor(session_key, handle, task.abort_handle());
    }
}

/// Wait for the container to exit, then keep the record for the grace period.
///
/// A container still running after `job_timeout` is left alone and only
/// dropped from tracking.
async fn wait_job(
    runtime: Arc<dyn ContainerRuntime>,
    tracker: Arc<JobTracker>,
    monitor: MonitorConfig,
    job_timeout: Duration,
    session_key: String,
    handle: JobHandle,
) {
    let waited = tokio::time::timeout(job_timeout, runtime.wait_for_exit(handle.as_str())).await;
    let status = match waited {
        Ok(Ok(0)) => JobStatus::Succeeded,
        Ok(Ok(exit_code)) => {
            tracing::info!(container = %handle, exit_code, "Container exited with an error");
            JobStatus::Failed
        }
        // Auto-removed before the wait was registered; the exit code is lost
        Ok(Err(RuntimeError::NotFound { .. })) => {
            tracing::warn!(
                session_key = %session_key,
                container = %handle,
                "Container was gone before its exit code was read"
            );
            JobStatus::Failed
        }
        Ok(Err(e)) => {
            tracing::warn!(
                session_key = %session_key,
                container = %handle,
                error = %e,
                "Waiting on container failed, no longer tracking"
            );
            tracker.remove_if(&session_key, &handle);
            return;
        }
        Err(_) => {
            tracing::warn!(
                session_key = %session_key,
                container = %handle,
                timeout_secs = job_timeout.as_secs(),
                "Container outlived the job timeout, no longer tracking"
            );
            tracker.remove_if(&session_key, &handle);
            return;
        }
    };

    tracing::info!(
        session_key = %session_key,
        container = %handle,
        status = %status,
        "Container finished"
    );
    tracker.record_outcome(&session_key, &handle, status);
    tokio::time::sleep(monitor.grace_period).await;
    tracker.remove_if(&session_key, &handle);
}

#[async_trait]
impl AgentManager for RuntimeJobManager {
    fn backend(&self) -> BackendKind {
        BackendKind::Runtime
    }

    async fn create_job(&self, request: &WorkerJobRequest) -> Result<JobHandle> {
        let guard = match claim_session(&self.limiter, &self.tracker, request).await? {
            Claim::Existing(handle) => return Ok(handle),
            Claim::Reserved(guard) => guard,
        };
        let session_key = guard.session_key().to_string();
        let actor_id = actor_key(request.actor_id.as_deref()).to_string();

        let name = job_name(&session_key);
        let spec = self.container_spec(&name, &actor_id, request);

        let id = match self.runtime.create_and_start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(
                    session_key = %session_key,
                    container = %name,
                    error = %reason,
                    "Failed to start container"
                );
                guard.fail(reason.clone());
                return Err(OrchestratorError::JobCreationFailed {
                    session_key,
                    operation: "start container",
                    reason,
                });
            }
        };

        let handle = JobHandle::from(id);
        let tracked = guard.commit(ActiveJob::new(
            session_key.as_str(),
            handle.clone(),
            actor_id.as_str(),
            Utc::now(),
        ));
        if !tracked {
            // Nothing would ever watch or remove this container
            tracing::warn!(
                session_key = %session_key,
                container = %handle,
                "Session was claimed by a newer job while starting, removing container"
            );
            if let Err(e) = self.runtime.remove(handle.as_str()).await {
                tracing::warn!(container = %handle, error = %e, "Failed to remove container");
            }
            return Err(OrchestratorError::JobCreationFailed {
                session_key,
                operation: "track container",
                reason: SUPERSEDED.to_string(),
            });
        }
        self.spawn_monitor(&session_key, &handle);

        tracing::info!(
            session_key = %session_key,
            actor_id = %actor_id,
            container = %handle,
            name = %name,
            "Started container"
        );
        Ok(handle)
    }

    async fn delete_job(&self, handle: &JobHandle) {
        self.tracker.remove_handle(handle);
        match self.runtime.remove(handle.as_str()).await {
            Ok(()) => tracing::info!(container = %handle, "Removed container"),
            Err(RuntimeError::NotFound { .. }) => {
                tracing::debug!(container = %handle, "Container already gone")
            }
            Err(e) => tracing::warn!(container = %handle, error = %e, "Failed to remove container"),
        }
    }

    async fn get_status(&self, handle: &JobHandle) -> JobStatus {
        match self.runtime.status(handle.as_str()).await {
            Ok(status) => status,
            Err(e) => {
                // Exited containers are auto-removed; the monitor kept the outcome
                if let Some(status) = self.tracker.outcome_for(handle) {
                    return status;
                }
                tracing::warn!(container = %handle, error = %e, "Container status unavailable");
                JobStatus::Unknown
            }
        }
    }

    async fn list_active(&self) -> Vec<ActiveJobSummary> {
        let tracked = self.tracker.snapshot();
        let statuses =
            futures::future::join_all(tracked.iter().map(|job| self.get_status(&job.handle)))
                .await;
        tracked
            .into_iter()
            .zip(statuses)
            .map(|(job, status)| ActiveJobSummary {
                handle: job.handle,
                session_key: job.session_key,
                actor_id: job.actor_id,
                created_at: job.created_at,
                status,
            })
            .collect()
    }

    fn active_count(&self) -> usize {
        self.tracker.len()
    }

    async fn cleanup(&self) {
        let drained = self.tracker.drain();
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|record| async move {
            if let Err(e) = self.runtime.remove(record.handle.as_str()).await
                && !matches!(e, RuntimeError::NotFound { .. })
            {
                tracing::warn!(
                    session_key = %record.session_key,
                    container = %record.handle,
                    error = %e,
                    "Failed to remove container during cleanup"
                );
            }
        }))
        .await;
        tracing::info!(count, "Cleaned up containers");
    }
}

impl Drop for RuntimeJobManager {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.tracker.abort_monitors();
    }
}
