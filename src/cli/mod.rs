//! Operator commands.
//!
//! Each invocation builds one manager from the environment, which for the
//! cluster backend includes a reconciliation pass, so `list` shows what is
//! actually running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::config::BackendKind;
use crate::orchestrator::{AgentManager, JobHandle, JobStatus, WorkerJobRequest};

#[derive(Parser, Debug)]
#[command(name = "session-jobs")]
#[command(about = "Run one ephemeral job per conversation session", version)]
pub struct Cli {
    /// Backend to use, overriding JOB_BACKEND (cluster or runtime)
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List tracked jobs with their live status
    List,

    /// Show the status of one job
    Status {
        /// Job name (cluster) or container id (runtime)
        handle: String,
    },

    /// Stop and remove a job
    Delete {
        /// Job name (cluster) or container id (runtime)
        handle: String,
    },

    /// Create the job for a request read from a JSON file
    Submit {
        /// Path to a WorkerJobRequest in JSON
        request: PathBuf,

        /// Stay attached until the job is no longer tracked, then clean up
        #[arg(long)]
        wait: bool,
    },
}

/// Run a command against `manager`.
pub async fn run_command(
    manager: Arc<dyn AgentManager>,
    command: Command,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    match command {
        Command::List => list_jobs(manager.as_ref()).await,
        Command::Status { handle } => {
            let status = manager.get_status(&JobHandle::from(handle.as_str())).await;
            println!("{}", status);
            Ok(())
        }
        Command::Delete { handle } => {
            manager.delete_job(&JobHandle::from(handle.as_str())).await;
            println!("Delete requested for {}", handle);
            Ok(())
        }
        Command::Submit { request, wait } => {
            let request = read_request(&request)?;
            let handle = manager.create_job(&request).await?;
            println!("{}", handle);
            if wait {
                let last = wait_for_job(manager.as_ref(), &handle, poll_interval).await;
                println!("{} {}", handle, last);
                manager.cleanup().await;
            }
            Ok(())
        }
    }
}

async fn list_jobs(manager: &dyn AgentManager) -> anyhow::Result<()> {
    let jobs = manager.list_active().await;
    if jobs.is_empty() {
        println!("No active jobs ({} backend).", manager.backend());
        return Ok(());
    }

    let width = jobs.iter().map(|j| j.handle.as_str().len()).max().unwrap_or(0);
    let now = Utc::now();
    for job in jobs {
        let age = (now - job.created_at).num_seconds().max(0);
        println!(
            "  {:width$}  {:9}  {:>6}s  {}  ({})",
            job.handle.as_str(),
            job.status.to_string(),
            age,
            job.session_key,
            job.actor_id,
            width = width
        );
    }
    Ok(())
}

fn read_request(path: &Path) -> anyhow::Result<WorkerJobRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid job request in {}", path.display()))
}

/// Poll until `handle` leaves the active set or Ctrl-C. Returns the last
/// status seen.
async fn wait_for_job(
    manager: &dyn AgentManager,
    handle: &JobHandle,
    poll_interval: Duration,
) -> JobStatus {
    let mut last = JobStatus::Pending;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(job = %handle, "Interrupted, cleaning up");
                return last;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let active = manager.list_active().await;
        match active.into_iter().find(|job| &job.handle == handle) {
            Some(job) => {
                if job.status != last {
                    println!("{} {}", handle, job.status);
                }
                last = job.status;
            }
            None => return last,
        }
    }
}
