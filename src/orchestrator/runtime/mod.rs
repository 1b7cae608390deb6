//! Local Docker backend.

pub mod api;
mod backend;
pub mod units;

pub use api::{ContainerRuntime, ContainerSpec, DockerRuntime};
pub use backend::RuntimeJobManager;
pub use units::{parse_cpu, parse_memory};
