//! Configuration for the job orchestration engine.
//!
//! Everything is injected once at construction. [`OrchestratorConfig::from_env`]
//! is a convenience for the binary; library callers can build the structs
//! directly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Which compute backend runs the jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Kubernetes `batch/v1` Jobs.
    #[default]
    Cluster,
    /// Containers on a local Docker daemon.
    Runtime,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cluster" | "kubernetes" | "k8s" => Ok(BackendKind::Cluster),
            "runtime" | "docker" => Ok(BackendKind::Runtime),
            _ => Err(format!(
                "invalid backend '{}', expected 'cluster' or 'runtime'",
                s
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Per-actor admission control.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Length of one admission window.
    pub window: Duration,
    /// Jobs an actor may create inside one window.
    pub max_jobs: u32,
    /// How often stale windows are swept.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_jobs: 5,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Background job monitoring.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay before the first status poll.
    pub initial_delay: Duration,
    /// Delay between status polls (cluster backend).
    pub poll_interval: Duration,
    /// Polls before the monitor gives up tracking a job.
    pub max_attempts: u32,
    /// How long a finished job stays tracked so its final status can be read.
    pub grace_period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            max_attempts: 60,
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Resource sizing in orchestrator quantity notation (`500m`, `4Gi`).
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_request: "500m".to_string(),
            cpu_limit: "2".to_string(),
            memory_request: "1Gi".to_string(),
            memory_limit: "4Gi".to_string(),
        }
    }
}

/// Kubernetes backend settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub namespace: String,
    /// API server base URL. `None` means in-cluster discovery.
    pub api_url: Option<String>,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    /// Value of the `app` label every job carries; reconciliation selects on it.
    pub app_label: String,
    /// Retention of finished jobs before the cluster garbage-collects them.
    pub ttl_after_finished: Duration,
    pub service_account: Option<String>,
    /// Secret the worker credentials are referenced from.
    pub secret_name: String,
    /// Keys of `secret_name` exposed to the worker as same-named env vars.
    pub secret_keys: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            api_url: None,
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            app_label: "session-jobs".to_string(),
            ttl_after_finished: Duration::from_secs(300),
            service_account: None,
            secret_name: "session-jobs-secrets".to_string(),
            secret_keys: default_credential_keys(),
        }
    }
}

/// A host directory bind-mounted into runtime containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMount {
    pub host_dir: PathBuf,
    pub container_dir: String,
    pub read_only: bool,
}

impl HostMount {
    /// Render as a Docker bind specification.
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!(
            "{}:{}:{}",
            self.host_dir.display(),
            self.container_dir,
            mode
        )
    }
}

impl FromStr for HostMount {
    type Err = String;

    /// Parses `host_dir:container_dir[:ro|rw]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (host, container, read_only) = match parts.as_slice() {
            [host, container] => (*host, *container, false),
            [host, container, "ro"] => (*host, *container, true),
            [host, container, "rw"] => (*host, *container, false),
            _ => {
                return Err(format!(
                    "invalid mount '{}', expected host_dir:container_dir[:ro|rw]",
                    s
                ));
            }
        };
        if host.is_empty() || !container.starts_with('/') {
            return Err(format!(
                "invalid mount '{}', container path must be absolute",
                s
            ));
        }
        Ok(Self {
            host_dir: PathBuf::from(host),
            container_dir: container.to_string(),
            read_only,
        })
    }
}

/// Docker backend settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Docker socket path. `None` uses bollard's local defaults.
    pub socket: Option<String>,
    pub host_mount: Option<HostMount>,
    pub network: String,
    /// Host env vars copied into each container.
    pub passthrough_env: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket: None,
            host_mount: None,
            network: "bridge".to_string(),
            passthrough_env: default_credential_keys(),
        }
    }
}

/// Top-level configuration for one [`AgentManager`](crate::orchestrator::AgentManager).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub backend: BackendKind,
    pub image: String,
    /// Backend-enforced deadline for a single job.
    pub job_timeout: Duration,
    pub resources: ResourceConfig,
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,
    pub cluster: ClusterConfig,
    pub runtime: RuntimeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            image: "ghcr.io/session-jobs/worker:latest".to_string(),
            job_timeout: Duration::from_secs(3600),
            resources: ResourceConfig::default(),
            rate_limit: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
            cluster: ClusterConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Select the backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the rate limit settings.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Replace the monitor settings.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Load `.env` (if present) and resolve from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        let backend = match env.get("JOB_BACKEND") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "JOB_BACKEND".to_string(),
                message,
            })?,
            None => defaults.backend,
        };

        let api_url = match env.get("CLUSTER_API_URL") {
            Some(url) => Some(url),
            None => match (
                env.get("KUBERNETES_SERVICE_HOST"),
                env.get("KUBERNETES_SERVICE_PORT"),
            ) {
                (Some(host), Some(port)) => Some(format!("https://{}:{}", host, port)),
                (Some(host), None) => Some(format!("https://{}", host)),
                _ => None,
            },
        };

        let host_mount = match env.get("RUNTIME_HOST_MOUNT") {
            Some(raw) => Some(raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "RUNTIME_HOST_MOUNT".to_string(),
                message,
            })?),
            None => None,
        };

        Ok(Self {
            backend,
            image: env.string("JOB_IMAGE", &defaults.image),
            job_timeout: env.secs("JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            resources: ResourceConfig {
                cpu_request: env.string("JOB_CPU_REQUEST", &defaults.resources.cpu_request),
                cpu_limit: env.string("JOB_CPU_LIMIT", &defaults.resources.cpu_limit),
                memory_request: env.string(
                    "JOB_MEMORY_REQUEST",
                    &defaults.resources.memory_request,
                ),
                memory_limit: env.string("JOB_MEMORY_LIMIT", &defaults.resources.memory_limit),
            },
            rate_limit: RateLimitConfig {
                window: env.secs("RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window)?,
                max_jobs: env.parse("RATE_LIMIT_MAX_JOBS", defaults.rate_limit.max_jobs)?,
                sweep_interval: defaults.rate_limit.sweep_interval,
            },
            monitor: MonitorConfig {
                initial_delay: env.secs(
                    "MONITOR_INITIAL_DELAY_SECS",
                    defaults.monitor.initial_delay,
                )?,
                poll_interval: env.secs(
                    "MONITOR_POLL_INTERVAL_SECS",
                    defaults.monitor.poll_interval,
                )?,
                max_attempts: env.parse("MONITOR_MAX_ATTEMPTS", defaults.monitor.max_attempts)?,
                grace_period: env.secs("MONITOR_GRACE_SECS", defaults.monitor.grace_period)?,
            },
            cluster: ClusterConfig {
                namespace: env.string("CLUSTER_NAMESPACE", &defaults.cluster.namespace),
                api_url,
                token_path: env
                    .get("CLUSTER_TOKEN_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.cluster.token_path),
                ca_path: env
                    .get("CLUSTER_CA_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.cluster.ca_path),
                app_label: defaults.cluster.app_label,
                ttl_after_finished: env.secs(
                    "CLUSTER_TTL_AFTER_FINISHED_SECS",
                    defaults.cluster.ttl_after_finished,
                )?,
                service_account: env.get("CLUSTER_SERVICE_ACCOUNT"),
                secret_name: env.string("CLUSTER_SECRET_NAME", &defaults.cluster.secret_name),
                secret_keys: env.list("CLUSTER_SECRET_KEYS", defaults.cluster.secret_keys),
            },
            runtime: RuntimeConfig {
                socket: env.get("RUNTIME_SOCKET"),
                host_mount,
                network: env.string("RUNTIME_NETWORK", &defaults.runtime.network),
                passthrough_env: env.list(
                    "RUNTIME_PASSTHROUGH_ENV",
                    defaults.runtime.passthrough_env,
                ),
            },
        })
    }
}

/// Credentials a worker usually needs: model access and repository access.
pub fn default_credential_keys() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".to_string(), "GITHUB_TOKEN".to_string()]
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty, trimmed value for `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{}': {}", raw, e),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        match self.get(key) {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("k8s".parse::<BackendKind>().unwrap(), BackendKind::Cluster);
        assert_eq!(
            "Kubernetes".parse::<BackendKind>().unwrap(),
            BackendKind::Cluster
        );
        assert_eq!(
            "docker".parse::<BackendKind>().unwrap(),
            BackendKind::Runtime
        );
        assert!("nomad".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend, BackendKind::Cluster);
        assert_eq!(config.rate_limit.window, Duration::from_secs(900));
        assert_eq!(config.rate_limit.max_jobs, 5);
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(10));
        assert_eq!(config.monitor.max_attempts, 60);
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.cluster.api_url, None);
        assert_eq!(config.runtime.host_mount, None);
    }

    #[test]
    fn test_overrides_from_env() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("JOB_BACKEND", "docker"),
            ("RATE_LIMIT_MAX_JOBS", "3"),
            ("RATE_LIMIT_WINDOW_SECS", "60"),
            ("CLUSTER_NAMESPACE", "agents"),
            ("CLUSTER_SECRET_KEYS", "A, B ,,C"),
            ("RUNTIME_HOST_MOUNT", "/srv/repos:/workspace:ro"),
            ("KUBERNETES_SERVICE_HOST", "10.0.0.1"),
            ("KUBERNETES_SERVICE_PORT", "443"),
        ]))
        .unwrap();

        assert_eq!(config.backend, BackendKind::Runtime);
        assert_eq!(config.rate_limit.max_jobs, 3);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.cluster.namespace, "agents");
        assert_eq!(config.cluster.secret_keys, vec!["A", "B", "C"]);
        assert_eq!(
            config.cluster.api_url.as_deref(),
            Some("https://10.0.0.1:443")
        );
        let mount = config.runtime.host_mount.unwrap();
        assert_eq!(mount.to_bind(), "/srv/repos:/workspace:ro");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("MONITOR_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("MONITOR_MAX_ATTEMPTS"));

        let err =
            OrchestratorConfig::from_lookup(lookup(&[("JOB_BACKEND", "nomad")])).unwrap_err();
        assert!(err.to_string().contains("JOB_BACKEND"));

        let err = OrchestratorConfig::from_lookup(lookup(&[("RUNTIME_HOST_MOUNT", "relative")]))
            .unwrap_err();
        assert!(err.to_string().contains("RUNTIME_HOST_MOUNT"));
    }

    #[test]
    fn test_host_mount_parsing() {
        let rw: HostMount = "/data:/workspace".parse().unwrap();
        assert!(!rw.read_only);
        assert_eq!(rw.to_bind(), "/data:/workspace:rw");
        assert!("/data:workspace".parse::<HostMount>().is_err());
        assert!("/data:/workspace:xx".parse::<HostMount>().is_err());
    }
}
