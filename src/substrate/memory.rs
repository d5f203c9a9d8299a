//! In-process substrate.
//!
//! Jobs never run; tests and `--backend memory` dry runs drive their state by
//! hand. Every job gets one unit named `<job>-0`, and more can be scripted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::JobBackend;
use crate::jobs::JobSpec;
use crate::models::{JobState, JobStatus};
use crate::workspace::RunLayout;

#[derive(Debug, Clone)]
struct Unit {
    name: String,
    log: String,
    log_error: Option<String>,
}

#[derive(Debug, Clone)]
struct MemJob {
    spec: JobSpec,
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    units: Vec<Unit>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<String, MemJob>,
    submitted: Vec<String>,
    reject_submissions: Vec<String>,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| anyhow!("In-memory backend lock poisoned: {}", e))
    }

    fn with_job<R>(&self, job_name: &str, f: impl FnOnce(&mut MemJob) -> R) -> Result<R> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(job_name)
            .with_context(|| format!("No such job: {}", job_name))?;
        Ok(f(job))
    }

    /// Move a job to `state`, stamping start and completion times.
    pub fn set_state(&self, job_name: &str, state: JobState) -> Result<()> {
        self.with_job(job_name, |job| {
            let now = Utc::now();
            if state != JobState::Pending && job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if matches!(state, JobState::Completed | JobState::Failed) {
                job.finished_at = Some(now);
            }
            job.state = state;
        })
    }

    /// Pretend the job finished `age` ago.
    pub fn backdate_finish(&self, job_name: &str, age: Duration) -> Result<()> {
        self.with_job(job_name, |job| {
            job.finished_at = Some(Utc::now() - age);
        })
    }

    pub fn append_log(&self, job_name: &str, text: &str) -> Result<()> {
        self.with_job(job_name, |job| {
            if let Some(unit) = job.units.first_mut() {
                unit.log.push_str(text);
            }
        })
    }

    /// Add another unit to a job. `error` makes its log unreadable.
    pub fn add_unit(&self, job_name: &str, log: &str, error: Option<&str>) -> Result<String> {
        self.with_job(job_name, |job| {
            let name = format!("{}-{}", job.spec.name, job.units.len());
            job.units.push(Unit {
                name: name.clone(),
                log: log.to_string(),
                log_error: error.map(str::to_string),
            });
            name
        })
    }

    /// Make a unit's log unreadable.
    pub fn fail_unit_log(&self, unit: &str, error: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let target = inner
            .jobs
            .values_mut()
            .flat_map(|job| job.units.iter_mut())
            .find(|u| u.name == unit)
            .with_context(|| format!("No such unit: {}", unit))?;
        target.log_error = Some(error.to_string());
        Ok(())
    }

    /// Make the next submission whose job name ends with `suffix` fail.
    pub fn reject_submission(&self, suffix: &str) -> Result<()> {
        self.lock()?.reject_submissions.push(suffix.to_string());
        Ok(())
    }

    /// Make every call fail, as if the substrate were down.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// Names of submitted jobs in submission order.
    pub fn submitted(&self) -> Vec<String> {
        self.lock().map(|i| i.submitted.clone()).unwrap_or_default()
    }

    pub fn spec(&self, job_name: &str) -> Option<JobSpec> {
        self.lock()
            .ok()
            .and_then(|i| i.jobs.get(job_name).map(|j| j.spec.clone()))
    }

    fn check_available(inner: &Inner) -> Result<()> {
        if inner.unavailable {
            bail!("substrate unavailable");
        }
        Ok(())
    }
}

fn status_of(job: &MemJob) -> JobStatus {
    JobStatus {
        name: job.spec.name.clone(),
        state: job.state,
        start_time: job.started_at.map(|t| t.to_rfc3339()),
        completion_time: job
            .finished_at
            .filter(|_| job.state == JobState::Completed)
            .map(|t| t.to_rfc3339()),
    }
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<()> {
        let mut inner = self.lock()?;
        Self::check_available(&inner)?;
        if let Some(pos) = inner
            .reject_submissions
            .iter()
            .position(|suffix| spec.name.ends_with(suffix.as_str()))
        {
            inner.reject_submissions.remove(pos);
            bail!("submission of {} rejected", spec.name);
        }
        if inner.jobs.contains_key(&spec.name) {
            bail!("job {} already exists", spec.name);
        }
        inner.jobs.insert(
            spec.name.clone(),
            MemJob {
                spec: spec.clone(),
                state: JobState::Pending,
                started_at: None,
                finished_at: None,
                units: vec![Unit {
                    name: format!("{}-0", spec.name),
                    log: String::new(),
                    log_error: None,
                }],
            },
        );
        inner.submitted.push(spec.name.clone());
        debug!(job = %spec.name, "Accepted job");
        Ok(())
    }

    async fn list_jobs(&self, run_id: &str) -> Result<Vec<JobStatus>> {
        let inner = self.lock()?;
        Self::check_available(&inner)?;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.spec.run_id == run_id)
            .map(status_of)
            .collect())
    }

    async fn list_units(&self, job_name: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Self::check_available(&inner)?;
        Ok(inner
            .jobs
            .get(job_name)
            .map(|job| job.units.iter().map(|u| u.name.clone()).collect())
            .unwrap_or_default())
    }

    async fn unit_log(&self, unit: &str) -> Result<String> {
        let inner = self.lock()?;
        Self::check_available(&inner)?;
        let unit = inner
            .jobs
            .values()
            .flat_map(|job| job.units.iter())
            .find(|u| u.name == unit)
            .with_context(|| format!("No such unit: {}", unit))?;
        match &unit.log_error {
            Some(error) => Err(anyhow!("{}", error)),
            None => Ok(unit.log.clone()),
        }
    }

    async fn reap_finished(&self, output_base: &Path) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        Self::check_available(&inner)?;
        let now = Utc::now();
        let expired: Vec<String> = inner
            .jobs
            .values()
            .filter(|job| {
                job.finished_at.is_some_and(|finished| {
                    let retention = Duration::seconds(job.spec.ttl_seconds_after_finished as i64);
                    finished + retention <= now
                })
            })
            .map(|job| job.spec.name.clone())
            .collect();

        for name in &expired {
            if let Some(job) = inner.jobs.remove(name) {
                let logs_dir = RunLayout::new(output_base, &job.spec.run_id).logs_dir;
                std::fs::create_dir_all(&logs_dir)?;
                let text: String = job.units.iter().map(|u| u.log.as_str()).collect();
                std::fs::write(logs_dir.join(format!("{}.log", name)), text)?;
                info!(job = %name, "Reaped finished job");
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::jobs::{JobRequest, JobSpecBuilder};
    use crate::models::Stage;
    use std::path::PathBuf;

    fn spec(run_id: &str, agent_id: u32) -> JobSpec {
        JobSpecBuilder::from_config(&FanoutConfig::default(), |_| None)
            .build(&JobRequest {
                stage: Stage::Worker,
                run_id: run_id.to_string(),
                agent_id,
                branch: format!("agent-{}", agent_id),
                worktree_path: PathBuf::from(format!("/out/run-{}/agent-{}", run_id, agent_id)),
                trunk_path: PathBuf::from(format!("/out/run-{}/repo", run_id)),
                prompt: Some("task".to_string()),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_list_by_run() {
        let backend = InMemoryBackend::new();
        backend.submit(&spec("aaaa", 0)).await.unwrap();
        backend.submit(&spec("aaaa", 1)).await.unwrap();
        backend.submit(&spec("bbbb", 0)).await.unwrap();

        let jobs = backend.list_jobs("aaaa").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.state == JobState::Pending));
        assert!(backend.list_jobs("cccc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submission_fails() {
        let backend = InMemoryBackend::new();
        backend.submit(&spec("aaaa", 0)).await.unwrap();
        assert!(backend.submit(&spec("aaaa", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_state_transitions_stamp_times() {
        let backend = InMemoryBackend::new();
        let s = spec("aaaa", 0);
        backend.submit(&s).await.unwrap();
        backend.set_state(&s.name, JobState::Running).unwrap();
        let status = &backend.list_jobs("aaaa").await.unwrap()[0];
        assert!(status.start_time.is_some());
        assert!(status.completion_time.is_none());

        backend.set_state(&s.name, JobState::Completed).unwrap();
        let status = &backend.list_jobs("aaaa").await.unwrap()[0];
        assert_eq!(status.state, JobState::Completed);
        assert!(status.completion_time.is_some());
    }

    #[tokio::test]
    async fn test_unit_logs_and_failures() {
        let backend = InMemoryBackend::new();
        let s = spec("aaaa", 0);
        backend.submit(&s).await.unwrap();
        backend.append_log(&s.name, "hello\n").unwrap();
        let broken = backend.add_unit(&s.name, "", Some("container gone")).unwrap();

        let units = backend.list_units(&s.name).await.unwrap();
        assert_eq!(units, vec![format!("{}-0", s.name), broken.clone()]);
        assert_eq!(backend.unit_log(&units[0]).await.unwrap(), "hello\n");
        let err = backend.unit_log(&broken).await.unwrap_err();
        assert!(err.to_string().contains("container gone"));
    }

    #[tokio::test]
    async fn test_reap_archives_and_removes_expired_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemoryBackend::new();
        let done = spec("aaaa", 0);
        let live = spec("aaaa", 1);
        backend.submit(&done).await.unwrap();
        backend.submit(&live).await.unwrap();
        backend.append_log(&done.name, "finished output").unwrap();
        backend.set_state(&done.name, JobState::Completed).unwrap();
        backend.backdate_finish(&done.name, Duration::hours(2)).unwrap();
        backend.set_state(&live.name, JobState::Running).unwrap();

        let reaped = backend.reap_finished(dir.path()).await.unwrap();
        assert_eq!(reaped, vec![done.name.clone()]);
        let archived = std::fs::read_to_string(
            dir.path().join("run-aaaa").join("logs").join(format!("{}.log", done.name)),
        )
        .unwrap();
        assert_eq!(archived, "finished output");
        assert_eq!(backend.list_jobs("aaaa").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let backend = InMemoryBackend::new();
        backend.set_unavailable(true).unwrap();
        assert!(backend.list_jobs("aaaa").await.is_err());
        assert!(backend.submit(&spec("aaaa", 0)).await.is_err());
    }
}
