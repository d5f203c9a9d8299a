//! Typed error hierarchy for the run orchestrator.
//!
//! `OrchestratorError` is the single taxonomy surfaced by the coordinator and
//! mapped onto HTTP status codes by the API layer:
//! - `Validation`: bad request shape, rejected before anything touches disk
//! - `Setup`: repository/worktree provisioning failed, the whole run is aborted
//! - `StageConflict` / `UnknownLane`: untrusted trigger that does not match lane state
//! - `JobFailure` / `MergeConflict`: lane-local outcomes, never fatal to siblings

use thiserror::Error;

use crate::models::{LaneStatus, Stage};

/// Errors from the workspace, coordinator and substrate layers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Failed to set up run workspace: {0}")]
    Setup(#[source] anyhow::Error),

    #[error(
        "Stage conflict for run {run_id} agent {agent_id}: expected {expected} running, lane is {actual_stage} {actual_status}"
    )]
    StageConflict {
        run_id: String,
        agent_id: u32,
        expected: Stage,
        actual_stage: Stage,
        actual_status: LaneStatus,
    },

    #[error("No lane {agent_id} in run {run_id}")]
    UnknownLane { run_id: String, agent_id: u32 },

    #[error("Job {job_name} failed: {message}")]
    JobFailure { job_name: String, message: String },

    #[error("Branch {branch} could not be merged into trunk: {message}")]
    MergeConflict { branch: String, message: String },

    #[error("Execution substrate error: {0}")]
    Substrate(#[source] anyhow::Error),

    #[error("State store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for errors caused by the caller rather than the orchestrator.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::StageConflict { .. } | Self::UnknownLane { .. }
        )
    }
}
