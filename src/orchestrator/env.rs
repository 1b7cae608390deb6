//! Environment handed to the worker process.
//!
//! Short identifiers travel as plain values. Free text (task, options,
//! history) is base64-encoded so quoting and newlines survive every backend.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::orchestrator::WorkerJobRequest;

pub const SESSION_KEY: &str = "SESSION_KEY";
pub const ACTOR_ID: &str = "ACTOR_ID";
pub const DISPLAY_NAME: &str = "DISPLAY_NAME";
pub const CHANNEL_REF: &str = "CHANNEL_REF";
pub const THREAD_REF: &str = "THREAD_REF";
pub const RESPONSE_TARGET: &str = "RESPONSE_TARGET";
pub const REPOSITORY_REF: &str = "REPOSITORY_REF";
pub const JOB_NAME: &str = "JOB_NAME";
pub const TASK_PAYLOAD_B64: &str = "TASK_PAYLOAD_B64";
pub const EXECUTION_OPTIONS_B64: &str = "EXECUTION_OPTIONS_B64";
pub const CONVERSATION_HISTORY_B64: &str = "CONVERSATION_HISTORY_B64";
/// Seconds the worker may run before it must exit. Set where the backend has
/// no deadline of its own.
pub const JOB_TIMEOUT_SECS: &str = "JOB_TIMEOUT_SECS";

/// Build the `(name, value)` pairs describing `request` to its worker.
pub fn worker_env(
    job_name: &str,
    actor_id: &str,
    request: &WorkerJobRequest,
) -> Vec<(String, String)> {
    let mut env = vec![
        (JOB_NAME, job_name.to_string()),
        (SESSION_KEY, request.session_key.clone()),
        (ACTOR_ID, actor_id.to_string()),
        (DISPLAY_NAME, request.display_name.clone()),
        (CHANNEL_REF, request.channel_ref.clone()),
        (THREAD_REF, request.thread_ref.clone()),
        (RESPONSE_TARGET, request.response_target.clone()),
        (TASK_PAYLOAD_B64, encode(&request.task_payload)),
    ];

    if let Some(ref repo) = request.repository_ref {
        env.push((REPOSITORY_REF, repo.clone()));
    }

    // ExecutionOptions only holds strings and integers
    let options = serde_json::to_string(&request.execution_options).unwrap_or_default();
    env.push((EXECUTION_OPTIONS_B64, encode(&options)));

    if let Some(ref history) = request.conversation_history {
        env.push((CONVERSATION_HISTORY_B64, encode(history)));
    }

    env.into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Decode a `*_B64` value. Used by tests and tooling that inspect specs.
pub fn decode(value: &str) -> Option<String> {
    STANDARD
        .decode(value)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Look up `name` in a built environment.
pub fn lookup<'a>(env: &'a [(String, String)], name: &str) -> Option<&'a str> {
    env.iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}
