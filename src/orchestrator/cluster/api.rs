//! Narrow client for the Kubernetes Jobs API.
//!
//! [`ClusterApi`] is the only surface the cluster backend talks to, and it
//! deals in [`ClusterJob`] values rather than raw API objects. [`KubeClient`]
//! implements it over HTTPS with the pod's service-account credentials.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::ClusterConfig;
use crate::error::ClusterApiError;
use crate::orchestrator::JobStatus;
use crate::orchestrator::cluster::manifest::{JobManifest, ObjectMeta};

/// Pod counters and conditions of one Job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// A `Complete` condition is true.
    pub complete: bool,
    /// A `Failed` condition is true (e.g. deadline exceeded).
    pub failed_condition: bool,
}

impl JobCounts {
    pub fn status(&self) -> JobStatus {
        if self.succeeded > 0 || self.complete {
            JobStatus::Succeeded
        } else if self.failed > 0 || self.failed_condition {
            JobStatus::Failed
        } else if self.active > 0 {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }
}

/// A Job as seen by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterJob {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub counts: JobCounts,
}

impl ClusterJob {
    pub fn status(&self) -> JobStatus {
        self.counts.status()
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_job(&self, manifest: &JobManifest) -> Result<(), ClusterApiError>;

    async fn get_job(&self, name: &str) -> Result<ClusterJob, ClusterApiError>;

    /// Delete a job and, in the background, its pods.
    async fn delete_job(&self, name: &str) -> Result<(), ClusterApiError>;

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<ClusterJob>, ClusterApiError>;
}

// Wire shapes of the API server responses.

#[derive(Debug, Deserialize)]
struct JobObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<JobObjectStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct JobObjectStatus {
    #[serde(default)]
    active: Option<u32>,
    #[serde(default)]
    succeeded: Option<u32>,
    #[serde(default)]
    failed: Option<u32>,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Debug, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<JobObject>,
}

impl From<JobObject> for ClusterJob {
    fn from(obj: JobObject) -> Self {
        let status = obj.status.unwrap_or_default();
        let condition = |kind: &str| {
            status
                .conditions
                .iter()
                .any(|c| c.kind == kind && c.status == "True")
        };
        let counts = JobCounts {
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            complete: condition("Complete"),
            failed_condition: condition("Failed"),
        };
        Self {
            name: obj.metadata.name.unwrap_or_default(),
            annotations: obj.metadata.annotations,
            counts,
        }
    }
}

/// HTTPS client for the Kubernetes API server.
pub struct KubeClient {
    client: Client,
    base_url: String,
    namespace: String,
    token: SecretString,
}

impl KubeClient {
    /// Build a client from the service-account token and CA bundle.
    ///
    /// A missing CA file falls back to the system roots, which suits API
    /// servers behind a public certificate.
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ClusterApiError> {
        let base_url = config
            .api_url
            .clone()
            .ok_or_else(|| ClusterApiError::Credentials {
                reason: "no API server URL; set CLUSTER_API_URL or run inside a cluster"
                    .to_string(),
            })?;

        let token = std::fs::read_to_string(&config.token_path).map_err(|e| {
            ClusterApiError::Credentials {
                reason: format!(
                    "failed to read token {}: {}",
                    config.token_path.display(),
                    e
                ),
            }
        })?;

        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        match std::fs::read(&config.ca_path) {
            Ok(pem) => {
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    ClusterApiError::Credentials {
                        reason: format!("invalid CA bundle {}: {}", config.ca_path.display(), e),
                    }
                })?;
                builder = builder.add_root_certificate(cert);
            }
            Err(e) => {
                tracing::debug!(
                    path = %config.ca_path.display(),
                    error = %e,
                    "No cluster CA bundle, using system roots"
                );
            }
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token: SecretString::from(token.trim().to_string()),
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.base_url, self.namespace
        )
    }

    fn job_url(&self, name: &str) -> String {
        format!("{}/{}", self.jobs_url(), name)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    /// Map non-success statuses to errors and return the body text.
    async fn read_body(
        response: reqwest::Response,
        name: Option<&str>,
    ) -> Result<String, ClusterApiError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND
            && let Some(name) = name
        {
            return Err(ClusterApiError::NotFound {
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ClusterApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, ClusterApiError> {
        serde_json::from_str(body).map_err(|e| ClusterApiError::Decode {
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn create_job(&self, manifest: &JobManifest) -> Result<(), ClusterApiError> {
        let response = self
            .client
            .post(self.jobs_url())
            .header("Authorization", self.bearer())
            .json(manifest)
            .send()
            .await?;
        Self::read_body(response, None).await?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<ClusterJob, ClusterApiError> {
        let response = self
            .client
            .get(self.job_url(name))
            .header("Authorization", self.bearer())
            .send()
            .await?;
        let body = Self::read_body(response, Some(name)).await?;
        Ok(Self::decode::<JobObject>(&body)?.into())
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterApiError> {
        let response = self
            .client
            .delete(self.job_url(name))
            .header("Authorization", self.bearer())
            .json(&serde_json::json!({
                "kind": "DeleteOptions",
                "apiVersion": "v1",
                "propagationPolicy": "Background",
            }))
            .send()
            .await?;
        Self::read_body(response, Some(name)).await?;
        Ok(())
    }

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<ClusterJob>, ClusterApiError> {
        let url = format!(
            "{}?labelSelector={}",
            self.jobs_url(),
            urlencoding::encode(label_selector)
        );
        let response = self
            .client
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await?;
        let body = Self::read_body(response, None).await?;
        let list: JobList = Self::decode(&body)?;
        Ok(list.items.into_iter().map(ClusterJob::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_counts_to_status() {
        let mut counts = JobCounts::default();
        assert_eq!(counts.status(), JobStatus::Pending);
        counts.active = 1;
        assert_eq!(counts.status(), JobStatus::Running);
        counts.failed = 1;
        assert_eq!(counts.status(), JobStatus::Failed);
        counts.succeeded = 1;
        assert_eq!(counts.status(), JobStatus::Succeeded);

        let deadline = JobCounts {
            failed_condition: true,
            ..Default::default()
        };
        assert_eq!(deadline.status(), JobStatus::Failed);
    }

    #[test]
    fn test_decodes_job_list() {
        let body = r#"{
            "kind": "JobList",
            "items": [
                {
                    "metadata": {
                        "name": "sj-c1-abc",
                        "labels": {"app": "session-jobs"},
                        "annotations": {"session-key": "C1:1"}
                    },
                    "status": {"active": 1}
                },
                {
                    "metadata": {"name": "sj-c2-def"},
                    "status": {
                        "conditions": [
                            {"type": "Failed", "status": "True", "reason": "DeadlineExceeded"}
                        ]
                    }
                },
                {"metadata": {"name": "sj-c3-ghi"}}
            ]
        }"#;
        let list: JobList = KubeClient::decode(body).unwrap();
        let jobs: Vec<ClusterJob> = list.items.into_iter().map(ClusterJob::from).collect();

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].name, "sj-c1-abc");
        assert_eq!(jobs[0].annotations["session-key"], "C1:1");
        assert_eq!(jobs[0].status(), JobStatus::Running);
        assert_eq!(jobs[1].status(), JobStatus::Failed);
        assert_eq!(jobs[2].status(), JobStatus::Pending);
    }

    #[test]
    fn test_client_requires_api_url() {
        let config = ClusterConfig::default();
        let err = KubeClient::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("CLUSTER_API_URL"));
    }

    #[test]
    fn test_client_reads_token_file() {
        let mut token = tempfile::NamedTempFile::new().unwrap();
        writeln!(token, "abc.def.ghi").unwrap();

        let config = ClusterConfig {
            api_url: Some("https://10.0.0.1:443/".to_string()),
            token_path: token.path().to_path_buf(),
            ca_path: "/nonexistent/ca.crt".into(),
            namespace: "agents".to_string(),
            ..Default::default()
        };
        let client = KubeClient::from_config(&config).unwrap();
        assert_eq!(client.bearer(), "Bearer abc.def.ghi");
        assert_eq!(
            client.job_url("sj-x"),
            "https://10.0.0.1:443/apis/batch/v1/namespaces/agents/jobs/sj-x"
        );
    }
}
