//! Container runtime access.
//!
//! [`ContainerRuntime`] is the seam the runtime backend drives; [`DockerRuntime`]
//! implements it with bollard against the local Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::orchestrator::JobStatus;

/// Everything needed to start one worker container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Docker bind specifications (`host:container:mode`).
    pub binds: Vec<String>,
    /// Zero means unlimited.
    pub memory_bytes: i64,
    /// Zero means the daemon default.
    pub cpu_shares: i64,
    pub network: String,
    pub auto_remove: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Block until the container exits and return its exit code.
    async fn wait_for_exit(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn status(&self, id: &str) -> Result<JobStatus, RuntimeError>;

    /// Force-remove a container, stopping it if needed.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Docker daemon client.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect and ping the daemon.
    ///
    /// Tries the configured socket, then bollard's local defaults (`DOCKER_HOST`,
    /// `/var/run/docker.sock`), then the Docker Desktop socket under `$HOME`.
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        if let Some(ref socket) = config.socket {
            let docker = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?;
            docker.ping().await?;
            return Ok(Self::new(docker));
        }

        if let Ok(docker) = Docker::connect_with_local_defaults()
            && docker.ping().await.is_ok()
        {
            return Ok(Self::new(docker));
        }

        if let Some(home) = std::env::var_os("HOME") {
            let desktop_sock = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if desktop_sock.exists() {
                let sock_str = desktop_sock.to_string_lossy();
                let docker =
                    Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)?;
                docker.ping().await?;
                return Ok(Self::new(docker));
            }
        }

        Err(RuntimeError::Unavailable {
            reason: "no reachable Docker socket; set RUNTIME_SOCKET".to_string(),
        })
    }

    fn not_found(id: &str, err: bollard::errors::Error) -> RuntimeError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound { id: id.to_string() },
            other => RuntimeError::Docker(other),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            memory: (spec.memory_bytes > 0).then_some(spec.memory_bytes),
            cpu_shares: (spec.cpu_shares > 0).then_some(spec.cpu_shares),
            auto_remove: Some(spec.auto_remove),
            network_mode: Some(spec.network.clone()),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(Some(options), config)
            .await?
            .id;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            // A created-but-never-started container is not auto-removed
            let _ = self.remove(&id).await;
            return Err(e.into());
        }

        Ok(id)
    }

    async fn wait_for_exit(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Self::not_found(id, e)),
            None => Err(RuntimeError::WaitFailed {
                reason: "container wait stream ended unexpectedly".to_string(),
            }),
        }
    }

    async fn status(&self, id: &str) -> Result<JobStatus, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::not_found(id, e))?;

        let Some(state) = info.state else {
            return Ok(JobStatus::Unknown);
        };
        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => JobStatus::Pending,
            Some(
                ContainerStateStatusEnum::RUNNING
                | ContainerStateStatusEnum::PAUSED
                | ContainerStateStatusEnum::RESTARTING,
            ) => JobStatus::Running,
            Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
                match state.exit_code {
                    Some(0) => JobStatus::Succeeded,
                    _ => JobStatus::Failed,
                }
            }
            _ => JobStatus::Unknown,
        };
        Ok(status)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Self::not_found(id, e))
    }
}
