//! Run coordinator: owns the lifecycle of a run and its agent lanes.
//!
//! Every lane moves through
//! `worker(running) → worker(done) → reviewer(running) → reviewer(done) → committer(running) → committer(done|skipped)`
//! with `failed` reachable from any running state, and from a finished worker
//! or reviewer whose job has not exited yet. Forward moves are driven by stage
//! signals ([`RunCoordinator::advance_stage`]) and by reconciliation against the
//! substrate ([`RunCoordinator::get_status`]). Every move is a compare-and-set
//! in the store, so duplicate or racing signals advance a lane at most once.
//!
//! A signal only marks its stage done. The next stage's job is submitted once
//! the signalling job has exited successfully, so a lane never has two jobs
//! working in its worktree.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::StatusAggregator;
use crate::config::{FanoutConfig, MAX_STAGE_TIMEOUT_SECS};
use crate::errors::OrchestratorError;
use crate::jobs::{JobRequest, JobSpec, JobSpecBuilder};
use crate::models::{
    AgentLane, JobRecord, JobState, JobStatus, LaneReport, LaneState, LaneStatus, Run,
    RunReceipt, Stage, job_name,
};
use crate::review::{ReviewVerdict, parse_verdict};
use crate::settings;
use crate::store::{DbHandle, HistoryEntry, LaneUpdate};
use crate::substrate::JobBackend;
use crate::workspace::{ArtifactLookup, ProvisionedLane, WorkspaceManager};

/// Result of accepting a stage signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The next stage's job was launched.
    Advanced,
    /// The stage is done; the next stage launches once its job exits.
    Accepted,
    /// Nothing changed; the signal came too early and a later one may succeed.
    Deferred,
    /// The lane reached a terminal state without launching another job.
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvanceResult {
    pub outcome: AdvanceOutcome,
    pub lane: AgentLane,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tunables the coordinator reads from configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_agents: u32,
    pub stage_timeout: Duration,
    pub hook_command: String,
}

impl CoordinatorSettings {
    pub fn from_config(config: &FanoutConfig) -> Self {
        Self {
            max_agents: config.runs.max_agents,
            stage_timeout: Duration::seconds(
                config.runs.stage_timeout_secs.min(MAX_STAGE_TIMEOUT_SECS) as i64,
            ),
            hook_command: config.trigger.hook_command.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RunCoordinator {
    settings: CoordinatorSettings,
    workspace: WorkspaceManager,
    builder: JobSpecBuilder,
    backend: Arc<dyn JobBackend>,
    aggregator: StatusAggregator,
    db: DbHandle,
}

fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn conflict(lane: &AgentLane, expected: Stage) -> OrchestratorError {
    OrchestratorError::StageConflict {
        run_id: lane.run_id.clone(),
        agent_id: lane.agent_id,
        expected,
        actual_stage: lane.stage,
        actual_status: lane.status,
    }
}

/// Run blocking git work on the blocking pool.
async fn blocking<F, R>(f: F) -> anyhow::Result<R>
where
    F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("Blocking task panicked: {}", e))?
}

impl RunCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        workspace: WorkspaceManager,
        builder: JobSpecBuilder,
        backend: Arc<dyn JobBackend>,
        db: DbHandle,
    ) -> Self {
        let aggregator = StatusAggregator::new(
            backend.clone(),
            db.clone(),
            workspace.output_base().to_path_buf(),
        );
        Self {
            settings,
            workspace,
            builder,
            backend,
            aggregator,
            db,
        }
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    async fn db<F, R>(&self, f: F) -> Result<R, OrchestratorError>
    where
        F: FnOnce(&crate::store::StateDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(OrchestratorError::Store)
    }

    async fn load_lane(&self, run_id: &str, agent_id: u32) -> Result<AgentLane, OrchestratorError> {
        let rid = run_id.to_string();
        self.db(move |db| db.get_lane(&rid, agent_id))
            .await?
            .ok_or_else(|| OrchestratorError::UnknownLane {
                run_id: run_id.to_string(),
                agent_id,
            })
    }

    /// Compare-and-set a lane. `Ok(false)` means another caller got there first.
    async fn transition(
        &self,
        lane: &AgentLane,
        from: LaneState,
        to: LaneState,
        update: LaneUpdate,
    ) -> Result<bool, OrchestratorError> {
        let (rid, aid) = (lane.run_id.clone(), lane.agent_id);
        let moved = self
            .db(move |db| db.transition_lane(&rid, aid, from, to, update))
            .await?;
        if moved {
            info!(run_id = %lane.run_id, agent_id = lane.agent_id, from = %from, to = %to, "Lane transition");
        }
        Ok(moved)
    }

    async fn fail_lane(&self, lane: &AgentLane, stage: Stage, reason: String) -> Result<bool, OrchestratorError> {
        self.fail_from(lane, LaneState::running(stage), reason).await
    }

    async fn fail_from(&self, lane: &AgentLane, from: LaneState, reason: String) -> Result<bool, OrchestratorError> {
        warn!(run_id = %lane.run_id, agent_id = lane.agent_id, state = %from, reason = %reason, "Failing lane");
        self.transition(
            lane,
            from,
            LaneState::new(from.stage, LaneStatus::Failed),
            LaneUpdate {
                job_name: None,
                reason: Some(reason),
            },
        )
        .await
    }

    fn job_request(&self, lane: &AgentLane, stage: Stage, prompt: Option<String>) -> JobRequest {
        JobRequest {
            stage,
            run_id: lane.run_id.clone(),
            agent_id: lane.agent_id,
            branch: lane.branch.clone(),
            worktree_path: lane.worktree_path.clone(),
            trunk_path: self.workspace.layout(&lane.run_id).repo_dir,
            prompt,
        }
    }

    /// Write the role's settings into the lane worktree and hand the job to the
    /// substrate.
    async fn launch(&self, lane: &AgentLane, spec: &JobSpec) -> anyhow::Result<()> {
        let worktree = lane.worktree_path.clone();
        let (stage, hook) = (spec.stage, self.settings.hook_command.clone());
        blocking(move || settings::write_settings(&worktree, stage, &hook).map(|_| ())).await?;
        self.backend.submit(spec).await
    }

    // ── Run submission ───────────────────────────────────────────────

    /// Provision a run and launch one worker job per agent.
    ///
    /// Nothing touches disk until the request is validated. A setup failure
    /// aborts the whole run before any job is submitted; a submission failure
    /// only fails its own lane.
    pub async fn submit_run(
        &self,
        prompt: &str,
        agent_count: u32,
    ) -> Result<RunReceipt, OrchestratorError> {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(OrchestratorError::validation("Prompt must not be empty"));
        }
        if agent_count < 1 || agent_count > self.settings.max_agents {
            return Err(OrchestratorError::validation(format!(
                "Number of agents must be between 1 and {}",
                self.settings.max_agents
            )));
        }

        let run_id = new_run_id();
        let layout = self.workspace.layout(&run_id);
        info!(run_id = %run_id, agents = agent_count, "Submitting run");

        let (provisioned, seed_sha) = {
            let workspace = self.workspace.clone();
            let rid = run_id.clone();
            tokio::task::spawn_blocking(move || -> Result<_, OrchestratorError> {
                let lanes = workspace.provision(&rid, agent_count)?;
                let seed = workspace
                    .branch_head(&rid, crate::workspace::TRUNK_BRANCH)
                    .map_err(OrchestratorError::Setup)?;
                Ok((lanes, seed))
            })
            .await
            .map_err(|e| OrchestratorError::Setup(anyhow!("Provisioning task panicked: {}", e)))??
        };

        let now = Utc::now();
        let run = Run {
            run_id: run_id.clone(),
            prompt: prompt.clone(),
            agent_count,
            run_dir: layout.run_dir.clone(),
            repository_root: layout.repo_dir.clone(),
            created_at: now,
        };

        // Every spec is built before anything is persisted or submitted.
        let mut lanes = Vec::with_capacity(provisioned.len());
        let mut specs = Vec::with_capacity(provisioned.len());
        for ProvisionedLane {
            agent_id,
            branch,
            worktree_path,
        } in provisioned
        {
            let lane = AgentLane {
                run_id: run_id.clone(),
                agent_id,
                branch,
                worktree_path,
                stage: Stage::Worker,
                status: LaneStatus::Running,
                job_name: Some(job_name(&run_id, agent_id, Stage::Worker)),
                stage_started_at: now,
                reason: None,
            };
            let spec = match self
                .builder
                .build(&self.job_request(&lane, Stage::Worker, Some(prompt.clone())))
            {
                Ok(spec) => spec,
                Err(e) => {
                    self.discard_run(&layout.run_dir).await;
                    return Err(e);
                }
            };
            lanes.push(lane);
            specs.push(spec);
        }

        let records: Vec<JobRecord> = specs
            .iter()
            .map(|spec| JobRecord {
                job_name: spec.name.clone(),
                run_id: run_id.clone(),
                agent_id: spec.agent_id,
                stage: Stage::Worker,
                base_sha: Some(seed_sha.clone()),
                submitted_at: now,
            })
            .collect();
        let persisted = {
            let (run, lanes) = (run.clone(), lanes.clone());
            self.db(move |db| {
                db.insert_run(&run, &lanes)?;
                records.iter().try_for_each(|r| db.insert_job(r))
            })
            .await
        };
        if let Err(e) = persisted {
            self.discard_run(&layout.run_dir).await;
            return Err(e);
        }

        let mut job_names = Vec::with_capacity(specs.len());
        for (lane, spec) in lanes.iter().zip(&specs) {
            job_names.push(spec.name.clone());
            if let Err(e) = self.launch(lane, spec).await {
                self.fail_lane(lane, Stage::Worker, format!("Failed to submit job {}: {:#}", spec.name, e))
                    .await?;
            }
        }

        info!(run_id = %run_id, jobs = job_names.len(), "Run submitted");
        Ok(RunReceipt { run_id, job_names })
    }

    async fn discard_run(&self, run_dir: &std::path::Path) {
        let dir: PathBuf = run_dir.to_path_buf();
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(run_dir = %dir.display(), error = %e, "Failed to remove run directory");
        }
    }

    // ── Stage advancement ────────────────────────────────────────────

    /// Accept a stage completion signal for one lane.
    ///
    /// The signal is untrusted: it is only honoured when the lane is currently
    /// running `from_stage`. Anything else, including a repeat of an accepted
    /// signal, is a `StageConflict`.
    pub async fn advance_stage(
        &self,
        run_id: &str,
        agent_id: u32,
        from_stage: Stage,
    ) -> Result<AdvanceResult, OrchestratorError> {
        let lane = self.load_lane(run_id, agent_id).await?;
        if lane.state() != LaneState::running(from_stage) {
            return Err(conflict(&lane, from_stage));
        }

        let (outcome, detail) = match from_stage {
            Stage::Worker => self.finish_worker(&lane).await?,
            Stage::Reviewer => self.finish_reviewer(&lane).await?,
            // Committers have no trigger; they are resolved from job status.
            Stage::Committer => return Err(conflict(&lane, from_stage)),
        };

        let lane = self.load_lane(run_id, agent_id).await?;
        Ok(AdvanceResult {
            outcome,
            lane,
            detail,
        })
    }

    async fn finish_worker(
        &self,
        lane: &AgentLane,
    ) -> Result<(AdvanceOutcome, Option<String>), OrchestratorError> {
        let done = LaneState::new(Stage::Worker, LaneStatus::Done);
        if !self
            .transition(lane, LaneState::running(Stage::Worker), done, LaneUpdate::default())
            .await?
        {
            return Err(conflict(&self.load_lane(&lane.run_id, lane.agent_id).await?, Stage::Worker));
        }
        self.hand_off(lane, done).await
    }

    async fn finish_reviewer(
        &self,
        lane: &AgentLane,
    ) -> Result<(AdvanceOutcome, Option<String>), OrchestratorError> {
        let base_sha = match &lane.job_name {
            Some(name) => {
                let name = name.clone();
                self.db(move |db| db.get_job(&name))
                    .await?
                    .and_then(|job| job.base_sha)
            }
            None => None,
        };

        let lookup = {
            let (workspace, rid, branch) =
                (self.workspace.clone(), lane.run_id.clone(), lane.branch.clone());
            blocking(move || workspace.read_review_artifact(&rid, &branch, base_sha.as_deref()))
                .await
                .map_err(OrchestratorError::Other)?
        };

        let content = match lookup {
            ArtifactLookup::Present(content) => content,
            ArtifactLookup::Missing => {
                debug!(run_id = %lane.run_id, agent_id = lane.agent_id, "Review artifact not committed yet");
                return Ok((AdvanceOutcome::Deferred, Some("review artifact not committed".into())));
            }
            ArtifactLookup::Unchanged => {
                debug!(run_id = %lane.run_id, agent_id = lane.agent_id, "Review artifact unchanged since review started");
                return Ok((
                    AdvanceOutcome::Deferred,
                    Some("review artifact unchanged since review started".into()),
                ));
            }
        };

        let (verdict, explicit) = parse_verdict(&content);
        if !explicit {
            warn!(run_id = %lane.run_id, agent_id = lane.agent_id, "Review artifact has no recognised verdict, treating as needs-work");
        }

        let done = LaneState::new(Stage::Reviewer, LaneStatus::Done);
        if !self
            .transition(lane, LaneState::running(Stage::Reviewer), done, LaneUpdate::default())
            .await?
        {
            return Err(conflict(&self.load_lane(&lane.run_id, lane.agent_id).await?, Stage::Reviewer));
        }

        match verdict {
            ReviewVerdict::NeedsWork => {
                let reason = format!("review verdict: {}", verdict);
                self.transition(
                    lane,
                    done,
                    LaneState::new(Stage::Committer, LaneStatus::Skipped),
                    LaneUpdate {
                        job_name: None,
                        reason: Some(reason.clone()),
                    },
                )
                .await?;
                Ok((AdvanceOutcome::Resolved, Some(reason)))
            }
            ReviewVerdict::Approved => self.hand_off(lane, done).await,
        }
    }

    /// Launch the stage after `done` if the job of the finished stage has
    /// already exited cleanly. Otherwise reconciliation launches it later.
    async fn hand_off(
        &self,
        lane: &AgentLane,
        done: LaneState,
    ) -> Result<(AdvanceOutcome, Option<String>), OrchestratorError> {
        let Some(next) = done.stage.next() else {
            return Err(conflict(lane, done.stage));
        };
        if self.current_job_state(lane).await == JobState::Completed {
            self.launch_next(lane, done, next).await?;
            return Ok((AdvanceOutcome::Advanced, None));
        }
        let job = lane.job_name.as_deref().unwrap_or_default();
        Ok((
            AdvanceOutcome::Accepted,
            Some(format!("{} launches once job {} exits", next, job)),
        ))
    }

    async fn current_job_state(&self, lane: &AgentLane) -> JobState {
        let Some(name) = lane.job_name.as_deref() else {
            return JobState::Unknown;
        };
        match self.aggregator.list_jobs(&lane.run_id).await {
            Ok(jobs) => jobs
                .into_iter()
                .find(|j| j.name == name)
                .map(|j| j.state)
                .unwrap_or(JobState::Unknown),
            Err(e) => {
                warn!(run_id = %lane.run_id, error = %e, "Substrate unavailable, deferring handoff");
                JobState::Unknown
            }
        }
    }

    /// Move a lane from `from` (its previous stage, done) into `stage` and
    /// submit that stage's job. Any failure after the move fails the new stage.
    async fn launch_next(
        &self,
        lane: &AgentLane,
        from: LaneState,
        stage: Stage,
    ) -> Result<(), OrchestratorError> {
        let name = job_name(&lane.run_id, lane.agent_id, stage);
        if !self
            .transition(
                lane,
                from,
                LaneState::running(stage),
                LaneUpdate {
                    job_name: Some(name.clone()),
                    reason: None,
                },
            )
            .await?
        {
            return Err(conflict(&self.load_lane(&lane.run_id, lane.agent_id).await?, stage));
        }

        let result: anyhow::Result<()> = async {
            let spec = self.builder.build(&self.job_request(lane, stage, None))?;
            let base_sha = {
                let (workspace, rid, branch) =
                    (self.workspace.clone(), lane.run_id.clone(), lane.branch.clone());
                blocking(move || workspace.branch_head(&rid, &branch)).await?
            };
            let record = JobRecord {
                job_name: name.clone(),
                run_id: lane.run_id.clone(),
                agent_id: lane.agent_id,
                stage,
                base_sha: Some(base_sha),
                submitted_at: Utc::now(),
            };
            self.db.call(move |db| db.insert_job(&record)).await?;
            self.launch(lane, &spec).await
        }
        .await;

        if let Err(e) = result {
            self.fail_lane(lane, stage, format!("Failed to submit job {}: {:#}", name, e))
                .await?;
        }
        Ok(())
    }

    // ── Status and reconciliation ────────────────────────────────────

    /// Lane reports for a run, reconciled against live substrate state first.
    /// An unknown run yields an empty list.
    pub async fn get_status(&self, run_id: &str) -> Result<Vec<LaneReport>, OrchestratorError> {
        let rid = run_id.to_string();
        let lanes = self.db(move |db| db.list_lanes(&rid)).await?;
        if lanes.is_empty() {
            return Ok(Vec::new());
        }

        let jobs: HashMap<String, JobStatus> = match self.aggregator.list_jobs(run_id).await {
            Ok(jobs) => jobs.into_iter().map(|j| (j.name.clone(), j)).collect(),
            Err(e) => {
                // Without substrate truth nothing can be reconciled.
                warn!(run_id, error = %e, "Substrate unavailable, reporting stored lane state");
                return Ok(lanes.iter().map(|l| report(l, None)).collect());
            }
        };

        let mut reports = Vec::with_capacity(lanes.len());
        for lane in lanes {
            let job = lane.job_name.as_ref().and_then(|n| jobs.get(n));
            let lane = match lane.status {
                LaneStatus::Running => self.reconcile_lane(lane, job).await?,
                LaneStatus::Done if !lane.state().is_terminal() => {
                    self.reconcile_handoff(lane, job).await?
                }
                _ => lane,
            };
            let job = lane.job_name.as_ref().and_then(|n| jobs.get(n));
            reports.push(report(&lane, job));
        }
        Ok(reports)
    }

    /// Apply the reconciliation rules to one running lane and return its
    /// current state.
    async fn reconcile_lane(
        &self,
        lane: AgentLane,
        job: Option<&JobStatus>,
    ) -> Result<AgentLane, OrchestratorError> {
        let stage = lane.stage;
        let job_label = lane.job_name.clone().unwrap_or_default();
        let state = job.map(|j| j.state).unwrap_or(JobState::Unknown);

        let changed = match (state, stage) {
            (JobState::Failed, _) => {
                let failure = OrchestratorError::JobFailure {
                    job_name: job_label,
                    message: "exited unsuccessfully".to_string(),
                };
                self.fail_lane(&lane, stage, failure.to_string()).await?
            }
            (JobState::Completed, Stage::Worker | Stage::Reviewer) => {
                self.fail_lane(
                    &lane,
                    stage,
                    "job completed without signalling stage completion".to_string(),
                )
                .await?
            }
            (JobState::Completed, Stage::Committer) => self.resolve_committer(&lane).await?,
            _ => {
                // A reaped committer leaves no job behind; the merge itself is the evidence.
                if stage == Stage::Committer
                    && state == JobState::Unknown
                    && self.is_merged(&lane).await?
                {
                    self.resolve_committer(&lane).await?
                } else if Utc::now() - lane.stage_started_at > self.settings.stage_timeout {
                    self.fail_lane(&lane, stage, "stage deadline exceeded".to_string())
                        .await?
                } else {
                    false
                }
            }
        };

        if changed {
            self.load_lane(&lane.run_id, lane.agent_id).await
        } else {
            Ok(lane)
        }
    }

    /// A worker or reviewer that signalled completion: launch the next stage
    /// once its job exits cleanly, fail the lane if the job fails instead.
    async fn reconcile_handoff(
        &self,
        lane: AgentLane,
        job: Option<&JobStatus>,
    ) -> Result<AgentLane, OrchestratorError> {
        let done = lane.state();
        let Some(next) = done.stage.next() else {
            return Ok(lane);
        };
        let job_label = lane.job_name.clone().unwrap_or_default();

        let changed = match job.map(|j| j.state).unwrap_or(JobState::Unknown) {
            JobState::Completed => match self.launch_next(&lane, done, next).await {
                Ok(()) => true,
                // a concurrent reconcile launched it
                Err(OrchestratorError::StageConflict { .. }) => true,
                Err(e) => return Err(e),
            },
            JobState::Failed => {
                let failure = OrchestratorError::JobFailure {
                    job_name: job_label,
                    message: "exited unsuccessfully after signalling completion".to_string(),
                };
                self.fail_from(&lane, done, failure.to_string()).await?
            }
            _ if Utc::now() - lane.stage_started_at > self.settings.stage_timeout => {
                self.fail_from(&lane, done, "stage deadline exceeded".to_string())
                    .await?
            }
            _ => false,
        };

        if changed {
            self.load_lane(&lane.run_id, lane.agent_id).await
        } else {
            Ok(lane)
        }
    }

    async fn is_merged(&self, lane: &AgentLane) -> Result<bool, OrchestratorError> {
        let (workspace, rid, branch) =
            (self.workspace.clone(), lane.run_id.clone(), lane.branch.clone());
        blocking(move || workspace.is_merged_into_trunk(&rid, &branch))
            .await
            .map_err(OrchestratorError::Other)
    }

    /// A finished committer either merged the branch or withheld the merge.
    async fn resolve_committer(&self, lane: &AgentLane) -> Result<bool, OrchestratorError> {
        let (to, reason) = if self.is_merged(lane).await? {
            (LaneState::new(Stage::Committer, LaneStatus::Done), None)
        } else {
            let withheld = OrchestratorError::MergeConflict {
                branch: lane.branch.clone(),
                message: "committer finished without merging".to_string(),
            };
            (
                LaneState::new(Stage::Committer, LaneStatus::Skipped),
                Some(withheld.to_string()),
            )
        };
        self.transition(
            lane,
            LaneState::running(Stage::Committer),
            to,
            LaneUpdate {
                job_name: None,
                reason,
            },
        )
        .await
    }

    /// Operator action: fail a running lane.
    pub async fn mark_failed(
        &self,
        run_id: &str,
        agent_id: u32,
        reason: &str,
    ) -> Result<AgentLane, OrchestratorError> {
        let lane = self.load_lane(run_id, agent_id).await?;
        if lane.state().is_terminal()
            || !self.fail_from(&lane, lane.state(), reason.to_string()).await?
        {
            let current = self.load_lane(run_id, agent_id).await?;
            return Err(conflict(&current, lane.stage));
        }
        self.load_lane(run_id, agent_id).await
    }

    /// Reconcile every run that still has lanes able to move. Returns how many
    /// runs were checked.
    pub async fn sweep(&self) -> Result<usize, OrchestratorError> {
        let run_ids = self.db(|db| db.active_run_ids()).await?;
        for run_id in &run_ids {
            if let Err(e) = self.get_status(run_id).await {
                warn!(run_id = %run_id, error = %e, "Reconciliation failed");
            }
        }
        Ok(run_ids.len())
    }

    pub async fn lane_history(
        &self,
        run_id: &str,
        agent_id: u32,
    ) -> Result<Vec<HistoryEntry>, OrchestratorError> {
        let rid = run_id.to_string();
        self.db(move |db| db.lane_history(&rid, agent_id)).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, OrchestratorError> {
        let rid = run_id.to_string();
        self.db(move |db| db.get_run(&rid)).await
    }
}

fn report(lane: &AgentLane, job: Option<&JobStatus>) -> LaneReport {
    LaneReport {
        agent_id: lane.agent_id,
        branch: lane.branch.clone(),
        job_name: lane.job_name.clone(),
        stage: lane.stage,
        status: lane.status,
        job_state: job.map(|j| j.state).unwrap_or(JobState::Unknown),
        start_time: job.and_then(|j| j.start_time.clone()),
        completion_time: job.and_then(|j| j.completion_time.clone()),
        reason: lane.reason.clone(),
    }
}
