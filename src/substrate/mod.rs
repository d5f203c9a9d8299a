//! Execution substrate abstraction.
//!
//! The coordinator submits [`JobSpec`]s and later asks for job state and unit
//! logs; how jobs actually run is up to the backend.
//! Real implementation: [`DockerBackend`]. Test double and dry-run backend:
//! [`InMemoryBackend`].

pub mod docker;
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{BackendKind, FanoutConfig};
use crate::jobs::JobSpec;
use crate::models::JobStatus;

pub use docker::DockerBackend;
pub use memory::InMemoryBackend;

#[async_trait]
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit a job. Fails if a job with the same name already exists.
    async fn submit(&self, spec: &JobSpec) -> Result<()>;

    /// All jobs labelled with `run_id`, classified from substrate state only.
    async fn list_jobs(&self, run_id: &str) -> Result<Vec<JobStatus>>;

    /// Execution units (containers, pods) belonging to a job.
    async fn list_units(&self, job_name: &str) -> Result<Vec<String>>;

    async fn unit_log(&self, unit: &str) -> Result<String>;

    /// Archive the logs of jobs finished longer ago than their retention
    /// window under `<output_base>/run-<id>/logs/`, then remove them.
    /// Returns the names of the reaped jobs.
    async fn reap_finished(&self, output_base: &Path) -> Result<Vec<String>>;
}

/// Create the backend selected in configuration.
pub fn from_config(config: &FanoutConfig) -> Result<Arc<dyn JobBackend>> {
    match config.jobs.backend {
        BackendKind::Docker => Ok(Arc::new(DockerBackend::connect(&config.jobs.app_label)?)),
        BackendKind::Memory => Ok(Arc::new(InMemoryBackend::new())),
    }
}
