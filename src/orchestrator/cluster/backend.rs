//! Kubernetes-backed [`AgentManager`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::config::{BackendKind, MonitorConfig, OrchestratorConfig};
use crate::error::{ClusterApiError, OrchestratorError, Result};
use crate::orchestrator::cluster::api::{ClusterApi, ClusterJob};
use crate::orchestrator::cluster::manifest::{
    ANNOTATION_ACTOR_ID, ANNOTATION_CREATED_AT, ANNOTATION_SESSION_KEY, LABEL_APP,
    LABEL_SESSION_KEY, build_manifest,
};
use crate::orchestrator::naming::{job_name, sanitize_label_value};
use crate::orchestrator::rate_limit::{ANONYMOUS_ACTOR, RateLimiter, actor_key};
use crate::orchestrator::tracker::{ActiveJob, JobTracker, SUPERSEDED};
use crate::orchestrator::{
    ActiveJobSummary, AgentManager, Claim, JobHandle, JobStatus, WorkerJobRequest, claim_session,
};

/// Runs one Kubernetes Job per session.
///
/// Construction reconciles the tracked set against the cluster, so a
/// restarted process picks up the jobs its predecessor left running.
pub struct ClusterJobManager {
    config: OrchestratorConfig,
    api: Arc<dyn ClusterApi>,
    tracker: Arc<JobTracker>,
    limiter: Arc<RateLimiter>,
    sweeper: JoinHandle<()>,
}

impl ClusterJobManager {
    /// Create the manager and reconcile before returning.
    pub async fn new(config: OrchestratorConfig, api: Arc<dyn ClusterApi>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let sweeper = limiter.spawn_sweeper();
        let manager = Self {
            config,
            api,
            tracker: JobTracker::new(),
            limiter,
            sweeper,
        };
        manager.reconcile().await;
        manager
    }

    /// Re-track every non-terminal job carrying this deployment's app label.
    ///
    /// Failure to reach the cluster is logged; the manager still serves new
    /// sessions.
    async fn reconcile(&self) {
        let selector = format!("{}={}", LABEL_APP, self.config.cluster.app_label);
        let jobs = match self.api.list_jobs(&selector).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(
                    selector = %selector,
                    error = %e,
                    "Startup reconciliation failed, continuing with an empty job map"
                );
                return;
            }
        };

        let listed = jobs.len();
        let mut adopted = 0usize;
        for job in jobs {
            if job.status().is_terminal() {
                continue;
            }
            let Some(record) = record_from(&job) else {
                tracing::warn!(job = %job.name, "Job has no session-key annotation, not tracking");
                continue;
            };
            let session_key = record.session_key.clone();
            let handle = record.handle.clone();
            if self.tracker.adopt(record) {
                self.spawn_monitor(&session_key, &handle);
                adopted += 1;
            } else {
                tracing::warn!(
                    session_key = %session_key,
                    job = %handle,
                    "Session already tracked, ignoring duplicate running job"
                );
            }
        }

        tracing::info!(listed, adopted, "Reconciled jobs with the cluster");
    }

    /// Find a running job for `session_key` that the tracker does not know.
    ///
    /// Lookup errors are logged and treated as "none", so creation proceeds.
    async fn find_untracked(&self, session_key: &str) -> Option<ClusterJob> {
        let selector = format!(
            "{}={},{}={}",
            LABEL_APP,
            self.config.cluster.app_label,
            LABEL_SESSION_KEY,
            sanitize_label_value(session_key)
        );
        match self.api.list_jobs(&selector).await {
            Ok(jobs) => jobs.into_iter().find(|job| {
                !job.status().is_terminal()
                    && job.annotations.get(ANNOTATION_SESSION_KEY).map(String::as_str)
                        == Some(session_key)
            }),
            Err(e) => {
                tracing::warn!(session_key = %session_key, error = %e, "Job lookup failed");
                None
            }
        }
    }

    fn spawn_monitor(&self, session_key: &str, handle: &JobHandle) {
        let task = tokio::spawn(poll_job(
            Arc::clone(&self.api),
            Arc::clone(&self.tracker),
            self.config.monitor.clone(),
            session_key.to_string(),
            handle.clone(),
        ));
        self.tracker
            .attach_monitor(session_key, handle, task.abort_handle());
    }
}

/// Tracking record for a job listed from the cluster.
fn record_from(job: &ClusterJob) -> Option<ActiveJob> {
    let session_key = job
        .annotations
        .get(ANNOTATION_SESSION_KEY)
        .filter(|key| !key.is_empty())?;
    let actor_id = job
        .annotations
        .get(ANNOTATION_ACTOR_ID)
        .map(String::as_str)
        .unwrap_or(ANONYMOUS_ACTOR);
    let created_at = job
        .annotations
        .get(ANNOTATION_CREATED_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(ActiveJob::new(
        session_key.as_str(),
        JobHandle::from(job.name.as_str()),
        actor_id,
        created_at,
    ))
}

/// Poll one job until it finishes, the attempts run out, or it stops being
/// tracked. Only touches the tracker; the cluster reaps the job itself.
async fn poll_job(
    api: Arc<dyn ClusterApi>,
    tracker: Arc<JobTracker>,
    monitor: MonitorConfig,
    session_key: String,
    handle: JobHandle,
) {
    tokio::time::sleep(monitor.initial_delay).await;

    for attempt in 1..=monitor.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(monitor.poll_interval).await;
        }
        if !tracker.is_tracking(&session_key, &handle) {
            return;
        }

        let status = match api.get_job(handle.as_str()).await {
            Ok(job) => job.status(),
            Err(e) => {
                tracing::warn!(
                    session_key = %session_key,
                    job = %handle,
                    error = %e,
                    "Job status read failed, no longer tracking"
                );
                tracker.remove_if(&session_key, &handle);
                return;
            }
        };

        if status.is_terminal() {
            tracing::info!(
                session_key = %session_key,
                job = %handle,
                status = %status,
                "Job finished"
            );
            tracker.record_outcome(&session_key, &handle, status);
            tokio::time::sleep(monitor.grace_period).await;
            tracker.remove_if(&session_key, &handle);
            return;
        }

        tracing::debug!(job = %handle, attempt, status = %status, "Job still in progress");
    }

    tracing::warn!(
        session_key = %session_key,
        job = %handle,
        attempts = monitor.max_attempts,
        "Job did not finish within the monitoring window, no longer tracking"
    );
    tracker.remove_if(&session_key, &handle);
}

#[async_trait]
impl AgentManager for ClusterJobManager {
    fn backend(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn create_job(&self, request: &WorkerJobRequest) -> Result<JobHandle> {
        let guard = match claim_session(&self.limiter, &self.tracker, request).await? {
            Claim::Existing(handle) => return Ok(handle),
            Claim::Reserved(guard) => guard,
        };
        let session_key = guard.session_key().to_string();
        let actor_id = actor_key(request.actor_id.as_deref()).to_string();

        if let Some(job) = self.find_untracked(&session_key).await {
            let handle = JobHandle::from(job.name.as_str());
            let record = record_from(&job).unwrap_or_else(|| {
                ActiveJob::new(session_key.as_str(), handle.clone(), actor_id.as_str(), Utc::now())
            });
            if !guard.commit(record) {
                return Err(OrchestratorError::JobCreationFailed {
                    session_key,
                    operation: "track job",
                    reason: SUPERSEDED.to_string(),
                });
            }
            self.spawn_monitor(&session_key, &handle);
            tracing::info!(
                session_key = %session_key,
                job = %handle,
                "Resuming untracked job for session"
            );
            return Ok(handle);
        }

        let name = job_name(&session_key);
        let created_at = Utc::now();
        let manifest = build_manifest(&self.config, &name, &actor_id, request, created_at);

        if let Err(e) = self.api.create_job(&manifest).await {
            let reason = e.to_string();
            tracing::error!(
                session_key = %session_key,
                job = %name,
                error = %reason,
                "Failed to create job"
            );
            guard.fail(reason.clone());
            return Err(OrchestratorError::JobCreationFailed {
                session_key,
                operation: "submit job",
                reason,
            });
        }

        let handle = JobHandle::from(name);
        let tracked = guard.commit(ActiveJob::new(
            session_key.as_str(),
            handle.clone(),
            actor_id.as_str(),
            created_at,
        ));
        if !tracked {
            tracing::warn!(
                session_key = %session_key,
                job = %handle,
                "Session was claimed by a newer job while submitting, deleting job"
            );
            if let Err(e) = self.api.delete_job(handle.as_str()).await {
                tracing::warn!(job = %handle, error = %e, "Failed to delete job");
            }
            return Err(OrchestratorError::JobCreationFailed {
                session_key,
                operation: "track job",
                reason: SUPERSEDED.to_string(),
            });
        }
        self.spawn_monitor(&session_key, &handle);

        tracing::info!(
            session_key = %session_key,
            actor_id = %actor_id,
            job = %handle,
            namespace = %self.config.cluster.namespace,
            "Created job"
        );
        Ok(handle)
    }

    async fn delete_job(&self, handle: &JobHandle) {
        if let Some(record) = self.tracker.remove_handle(handle) {
            tracing::debug!(session_key = %record.session_key, job = %handle, "Stopped tracking job");
        }
        match self.api.delete_job(handle.as_str()).await {
            Ok(()) => tracing::info!(job = %handle, "Deleted job"),
            Err(ClusterApiError::NotFound { .. }) => {
                tracing::debug!(job = %handle, "Job already gone")
            }
            Err(e) => tracing::warn!(job = %handle, error = %e, "Failed to delete job"),
        }
    }

    async fn get_status(&self, handle: &JobHandle) -> JobStatus {
        match self.api.get_job(handle.as_str()).await {
            Ok(job) => job.status(),
            Err(e) => {
                if let Some(status) = self.tracker.outcome_for(handle) {
                    return status;
                }
                tracing::warn!(job = %handle, error = %e, "Job status unavailable");
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
            if let Err(e) = self.api.delete_job(record.handle.as_str()).await
                && !matches!(e, ClusterApiError::NotFound { .. })
            {
                tracing::warn!(
                    session_key = %record.session_key,
                    job = %record.handle,
                    error = %e,
                    "Failed to delete job during cleanup"
                );
            }
        }))
        .await;
        tracing::info!(count, "Cleaned up cluster jobs");
    }
}

impl Drop for ClusterJobManager {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.tracker.abort_monitors();
    }
}
