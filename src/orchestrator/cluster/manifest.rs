//! Typed Kubernetes `batch/v1` Job manifest.
//!
//! Only the fields this engine writes or reads are modelled. Session metadata
//! is written twice: sanitized into labels (for label-selector queries) and
//! verbatim into annotations (the authoritative value reconciliation reads).

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::orchestrator::WorkerJobRequest;
use crate::orchestrator::env::worker_env;
use crate::orchestrator::naming::sanitize_label_value;

pub const LABEL_APP: &str = "app";
pub const LABEL_SESSION_KEY: &str = "session-key";
pub const LABEL_ACTOR_ID: &str = "actor-id";
pub const LABEL_COMPONENT: &str = "component";
pub const COMPONENT_WORKER: &str = "worker";

pub const ANNOTATION_SESSION_KEY: &str = "session-key";
pub const ANNOTATION_ACTOR_ID: &str = "actor-id";
pub const ANNOTATION_DISPLAY_NAME: &str = "display-name";
pub const ANNOTATION_CREATED_AT: &str = "created-at";

const CONTAINER_NAME: &str = "worker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Zero: a failed worker is reported, not retried.
    pub backoff_limit: u32,
    pub active_deadline_seconds: u64,
    pub ttl_seconds_after_finished: u64,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub restart_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl EnvVar {
    fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    fn secret(name: impl Into<String>, secret: &str, key: &str) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: SecretKeySelector {
                    name: secret.to_string(),
                    key: key.to_string(),
                    optional: Some(true),
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

/// Build the Job submitted for `request`.
pub fn build_manifest(
    config: &OrchestratorConfig,
    name: &str,
    actor_id: &str,
    request: &WorkerJobRequest,
    created_at: DateTime<Utc>,
) -> JobManifest {
    let cluster = &config.cluster;

    let labels: BTreeMap<String, String> = [
        (LABEL_APP, cluster.app_label.clone()),
        (LABEL_SESSION_KEY, sanitize_label_value(&request.session_key)),
        (LABEL_ACTOR_ID, sanitize_label_value(actor_id)),
        (LABEL_COMPONENT, COMPONENT_WORKER.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let annotations: BTreeMap<String, String> = [
        (ANNOTATION_SESSION_KEY, request.session_key.clone()),
        (ANNOTATION_ACTOR_ID, actor_id.to_string()),
        (ANNOTATION_DISPLAY_NAME, request.display_name.clone()),
        (
            ANNOTATION_CREATED_AT,
            created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let mut env: Vec<EnvVar> = worker_env(name, actor_id, request)
        .into_iter()
        .map(|(k, v)| EnvVar::literal(k, v))
        .collect();
    // Credentials stay in the secret store; the pod resolves them at start.
    env.extend(
        cluster
            .secret_keys
            .iter()
            .map(|key| EnvVar::secret(key.as_str(), &cluster.secret_name, key)),
    );

    let resources = ResourceRequirements {
        requests: [
            ("cpu".to_string(), config.resources.cpu_request.clone()),
            ("memory".to_string(), config.resources.memory_request.clone()),
        ]
        .into_iter()
        .collect(),
        limits: [
            ("cpu".to_string(), config.resources.cpu_limit.clone()),
            ("memory".to_string(), config.resources.memory_limit.clone()),
        ]
        .into_iter()
        .collect(),
    };

    JobManifest {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(cluster.namespace.clone()),
            labels: labels.clone(),
            annotations,
        },
        spec: JobSpec {
            backoff_limit: 0,
            active_deadline_seconds: config.job_timeout.as_secs(),
            ttl_seconds_after_finished: cluster.ttl_after_finished.as_secs(),
            template: PodTemplate {
                metadata: ObjectMeta {
                    labels,
                    ..Default::default()
                },
                spec: PodSpec {
                    restart_policy: "Never".to_string(),
                    service_account_name: cluster.service_account.clone(),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: config.image.clone(),
                        env,
                        resources,
                    }],
                },
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::orchestrator::env::{TASK_PAYLOAD_B64, decode};

    fn request() -> WorkerJobRequest {
        WorkerJobRequest {
            session_key: "C1:1700000000.0001".to_string(),
            actor_id: Some("U1".to_string()),
            display_name: "Ada Lovelace".to_string(),
            channel_ref: "C1".to_string(),
            thread_ref: "1700000000.0001".to_string(),
            task_payload: "summarize the thread".to_string(),
            repository_ref: Some("org/repo".to_string()),
            response_target: "https://hooks.example.com/T1".to_string(),
            execution_options: Default::default(),
            conversation_history: None,
        }
    }

    fn manifest() -> JobManifest {
        let mut config = OrchestratorConfig::default();
        config.job_timeout = Duration::from_secs(1800);
        config.cluster.namespace = "agents".to_string();
        config.cluster.secret_keys = vec!["ANTHROPIC_API_KEY".to_string()];
        let created_at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        build_manifest(&config, "sj-c1-abc", "U1", &request(), created_at)
    }

    #[test]
    fn test_metadata_carries_session() {
        let m = manifest();
        assert_eq!(m.metadata.name.as_deref(), Some("sj-c1-abc"));
        assert_eq!(m.metadata.namespace.as_deref(), Some("agents"));
        assert_eq!(m.metadata.labels[LABEL_APP], "session-jobs");
        assert_eq!(
            m.metadata.labels[LABEL_SESSION_KEY],
            "C1_1700000000.0001"
        );
        assert_eq!(m.metadata.labels[LABEL_COMPONENT], "worker");
        assert_eq!(
            m.metadata.annotations[ANNOTATION_SESSION_KEY],
            "C1:1700000000.0001"
        );
        assert_eq!(
            m.metadata.annotations[ANNOTATION_DISPLAY_NAME],
            "Ada Lovelace"
        );
        assert_eq!(
            m.metadata.annotations[ANNOTATION_CREATED_AT],
            "2026-01-02T03:04:05Z"
        );
        assert_eq!(m.spec.template.metadata.labels, m.metadata.labels);
    }

    #[test]
    fn test_spec_bounds_and_resources() {
        let m = manifest();
        assert_eq!(m.spec.backoff_limit, 0);
        assert_eq!(m.spec.active_deadline_seconds, 1800);
        assert_eq!(m.spec.ttl_seconds_after_finished, 300);
        assert_eq!(m.spec.template.spec.restart_policy, "Never");

        let container = &m.spec.template.spec.containers[0];
        assert_eq!(container.resources.requests["cpu"], "500m");
        assert_eq!(container.resources.limits["memory"], "4Gi");
    }

    #[test]
    fn test_secrets_are_references() {
        let m = manifest();
        let env = &m.spec.template.spec.containers[0].env;

        let secret = env.iter().find(|e| e.name == "ANTHROPIC_API_KEY").unwrap();
        assert_eq!(secret.value, None);
        let selector = &secret.value_from.as_ref().unwrap().secret_key_ref;
        assert_eq!(selector.name, "session-jobs-secrets");
        assert_eq!(selector.key, "ANTHROPIC_API_KEY");

        let task = env.iter().find(|e| e.name == TASK_PAYLOAD_B64).unwrap();
        assert_eq!(
            decode(task.value.as_deref().unwrap()).unwrap(),
            "summarize the thread"
        );
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(manifest()).unwrap();
        assert_eq!(json["apiVersion"], "batch/v1");
        assert_eq!(json["kind"], "Job");
        assert_eq!(json["spec"]["activeDeadlineSeconds"], 1800);
        assert_eq!(json["spec"]["ttlSecondsAfterFinished"], 300);
        assert_eq!(json["spec"]["template"]["spec"]["restartPolicy"], "Never");
        assert!(json["spec"]["template"]["spec"]
            .get("serviceAccountName")
            .is_none());
        let env = &json["spec"]["template"]["spec"]["containers"][0]["env"];
        let secret = env
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == "ANTHROPIC_API_KEY")
            .unwrap();
        assert_eq!(
            secret["valueFrom"]["secretKeyRef"]["name"],
            "session-jobs-secrets"
        );
    }
}
