//! Status and log aggregation over the execution substrate.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::OrchestratorError;
use crate::models::{JobStatus, PodLog};
use crate::store::DbHandle;
use crate::substrate::JobBackend;
use crate::workspace::RunLayout;

/// Unit name reported for logs served from the archive.
pub const ARCHIVE_UNIT: &str = "archive";

#[derive(Clone)]
pub struct StatusAggregator {
    backend: Arc<dyn JobBackend>,
    db: DbHandle,
    output_base: PathBuf,
}

impl StatusAggregator {
    pub fn new(backend: Arc<dyn JobBackend>, db: DbHandle, output_base: PathBuf) -> Self {
        Self {
            backend,
            db,
            output_base,
        }
    }

    pub async fn list_jobs(&self, run_id: &str) -> Result<Vec<JobStatus>, OrchestratorError> {
        self.backend
            .list_jobs(run_id)
            .await
            .map_err(OrchestratorError::Substrate)
    }

    /// One entry per execution unit of the job. A unit whose log cannot be read
    /// gets an `error` entry; the others are still returned.
    ///
    /// When the substrate no longer knows the job, the archived log is served.
    pub async fn fetch_logs(&self, job_name: &str) -> Result<Vec<PodLog>, OrchestratorError> {
        let units = match self.backend.list_units(job_name).await {
            Ok(units) => units,
            Err(e) => {
                warn!(job = %job_name, error = %format!("{:#}", e), "Failed to list job units");
                Vec::new()
            }
        };

        if units.is_empty() {
            return Ok(self.archived_log(job_name).await?.into_iter().collect());
        }

        let mut logs = Vec::with_capacity(units.len());
        for unit in units {
            match self.backend.unit_log(&unit).await {
                Ok(log) => logs.push(PodLog::ok(unit, log)),
                Err(e) => {
                    debug!(unit = %unit, error = %e, "Failed to read unit log");
                    logs.push(PodLog::failed(unit, format!("{:#}", e)));
                }
            }
        }
        Ok(logs)
    }

    async fn archived_log(&self, job_name: &str) -> Result<Option<PodLog>, OrchestratorError> {
        let name = job_name.to_string();
        let record = self
            .db
            .call(move |db| db.get_job(&name))
            .await
            .map_err(OrchestratorError::Store)?;
        let Some(record) = record else {
            return Ok(None);
        };

        let path = RunLayout::new(&self.output_base, &record.run_id)
            .logs_dir
            .join(format!("{}.log", job_name));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(PodLog::ok(ARCHIVE_UNIT, text))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Ok(Some(PodLog::failed(
                ARCHIVE_UNIT,
                format!("Failed to read {}: {}", path.display(), e),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::jobs::{JobRequest, JobSpecBuilder};
    use crate::models::{JobRecord, JobState, Stage};
    use crate::store::StateDb;
    use crate::substrate::InMemoryBackend;
    use chrono::Utc;

    async fn setup() -> (tempfile::TempDir, Arc<InMemoryBackend>, StatusAggregator, String) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let db = DbHandle::new(StateDb::new_in_memory().unwrap());
        let spec = JobSpecBuilder::from_config(&FanoutConfig::default(), |_| None)
            .build(&JobRequest {
                stage: Stage::Worker,
                run_id: "ab12cd34".to_string(),
                agent_id: 0,
                branch: "agent-0".to_string(),
                worktree_path: dir.path().join("run-ab12cd34/agent-0"),
                trunk_path: dir.path().join("run-ab12cd34/repo"),
                prompt: Some("task".to_string()),
            })
            .unwrap();
        backend.submit(&spec).await.unwrap();

        // bare run row so the job record's foreign key holds
        let record = JobRecord {
            job_name: spec.name.clone(),
            run_id: "ab12cd34".to_string(),
            agent_id: 0,
            stage: Stage::Worker,
            base_sha: None,
            submitted_at: Utc::now(),
        };
        let run = crate::models::Run {
            run_id: "ab12cd34".to_string(),
            prompt: "task".to_string(),
            agent_count: 1,
            run_dir: dir.path().join("run-ab12cd34"),
            repository_root: dir.path().join("run-ab12cd34/repo"),
            created_at: Utc::now(),
        };
        db.call(move |db| {
            db.insert_run(&run, &[])?;
            db.insert_job(&record)
        })
        .await
        .unwrap();

        let aggregator = StatusAggregator::new(backend.clone(), db, dir.path().to_path_buf());
        (dir, backend, aggregator, spec.name)
    }

    #[tokio::test]
    async fn test_one_failing_unit_does_not_hide_others() {
        let (_dir, backend, aggregator, job) = setup().await;
        backend.append_log(&job, "unit zero output").unwrap();
        backend.add_unit(&job, "unit one output", None).unwrap();
        let broken = backend.add_unit(&job, "", Some("log stream closed")).unwrap();

        let logs = aggregator.fetch_logs(&job).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].log.as_deref(), Some("unit zero output"));
        assert_eq!(logs[1].log.as_deref(), Some("unit one output"));
        assert_eq!(logs[2].unit, broken);
        assert!(logs[2].log.is_none());
        assert!(logs[2].error.as_deref().unwrap().contains("log stream closed"));
    }

    #[tokio::test]
    async fn test_reaped_job_serves_archived_log() {
        let (dir, backend, aggregator, job) = setup().await;
        backend.append_log(&job, "archived text").unwrap();
        backend.set_state(&job, JobState::Completed).unwrap();
        backend
            .backdate_finish(&job, chrono::Duration::hours(2))
            .unwrap();
        backend.reap_finished(dir.path()).await.unwrap();

        let logs = aggregator.fetch_logs(&job).await.unwrap();
        assert_eq!(logs, vec![PodLog::ok(ARCHIVE_UNIT, "archived text")]);
    }

    #[tokio::test]
    async fn test_unknown_job_has_no_logs() {
        let (_dir, _backend, aggregator, _job) = setup().await;
        assert!(aggregator.fetch_logs("fanout-zzzz-0-worker").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_surfaces_substrate_errors() {
        let (_dir, backend, aggregator, _job) = setup().await;
        assert_eq!(aggregator.list_jobs("ab12cd34").await.unwrap().len(), 1);
        backend.set_unavailable(true).unwrap();
        assert!(matches!(
            aggregator.list_jobs("ab12cd34").await,
            Err(OrchestratorError::Substrate(_))
        ));
    }
}
