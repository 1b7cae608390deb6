//! Kubernetes Jobs backend.

pub mod api;
mod backend;
pub mod manifest;

pub use api::{ClusterApi, ClusterJob, JobCounts, KubeClient};
pub use backend::ClusterJobManager;
pub use manifest::{JobManifest, build_manifest};
