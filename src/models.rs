use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage of an agent lane. Ordered: a lane only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Worker,
    Reviewer,
    Committer,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Reviewer => "reviewer",
            Self::Committer => "committer",
        }
    }

    /// The stage that follows this one, `None` for the terminal committer.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Worker => Some(Self::Reviewer),
            Self::Reviewer => Some(Self::Committer),
            Self::Committer => None,
        }
    }

    pub fn all() -> &'static [Stage] {
        &[Stage::Worker, Stage::Reviewer, Stage::Committer]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "worker" => Ok(Self::Worker),
            "reviewer" => Ok(Self::Reviewer),
            "committer" => Ok(Self::Committer),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Running,
    Done,
    /// Committer resolved without merging (review asked for more work, or the
    /// merge was withheld). A success outcome.
    Skipped,
    Failed,
}

impl LaneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaneStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid lane status: {}", s)),
        }
    }
}

/// Combined (stage, status) position of a lane in its pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneState {
    pub stage: Stage,
    pub status: LaneStatus,
}

impl LaneState {
    pub const fn new(stage: Stage, status: LaneStatus) -> Self {
        Self { stage, status }
    }

    pub const fn running(stage: Stage) -> Self {
        Self::new(stage, LaneStatus::Running)
    }

    /// No further transition is possible from this state.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            LaneStatus::Failed | LaneStatus::Skipped => true,
            LaneStatus::Done => self.stage == Stage::Committer,
            LaneStatus::Running => false,
        }
    }

    /// Position in the forward-only ordering; `None` for `failed`, which sits
    /// outside the ordering and is only reachable from a running state.
    fn rank(&self) -> Option<u8> {
        let stage = match self.stage {
            Stage::Worker => 0,
            Stage::Reviewer => 2,
            Stage::Committer => 4,
        };
        match self.status {
            LaneStatus::Running => Some(stage),
            LaneStatus::Done | LaneStatus::Skipped => Some(stage + 1),
            LaneStatus::Failed => None,
        }
    }
}

impl fmt::Display for LaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.stage, self.status)
    }
}

/// Validate a lane state transition.
///
/// Allowed moves are one step along
/// `W(running) → W(done) → R(running) → R(done) → C(running) → C(done|skipped)`,
/// the committer short-circuit `R(done) → C(skipped)` when the review asks for
/// more work, and `X(running|done) → X(failed)`. A worker or reviewer that is
/// done is still waiting for its job to exit, and that job can still fail.
pub fn is_valid_transition(from: &LaneState, to: &LaneState) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to.status == LaneStatus::Failed {
        return from.stage == to.stage
            && matches!(from.status, LaneStatus::Running | LaneStatus::Done);
    }
    if to.status == LaneStatus::Skipped && to.stage != Stage::Committer {
        return false;
    }
    match (from.rank(), to.rank()) {
        (Some(a), Some(b)) if b == a + 1 => true,
        // R(done) → C(skipped) without a committer job
        (Some(3), Some(5)) => to.status == LaneStatus::Skipped,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub prompt: String,
    pub agent_count: u32,
    pub run_dir: PathBuf,
    pub repository_root: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLane {
    pub run_id: String,
    pub agent_id: u32,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub stage: Stage,
    pub status: LaneStatus,
    pub job_name: Option<String>,
    pub stage_started_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl AgentLane {
    pub fn state(&self) -> LaneState {
        LaneState::new(self.stage, self.status)
    }
}

/// Bookkeeping for a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_name: String,
    pub run_id: String,
    pub agent_id: u32,
    pub stage: Stage,
    /// Lane branch head when the job was submitted.
    pub base_sha: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Job state as reported by the execution substrate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    /// The substrate has no record of the job (never created, or reclaimed).
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
}

/// Output of one execution unit backing a job. Exactly one of `log` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodLog {
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PodLog {
    pub fn ok(unit: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            log: Some(log.into()),
            error: None,
        }
    }

    pub fn failed(unit: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            log: None,
            error: Some(error.into()),
        }
    }
}

/// One row of a run status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneReport {
    pub agent_id: u32,
    pub branch: String,
    pub job_name: Option<String>,
    pub stage: Stage,
    pub status: LaneStatus,
    pub job_state: JobState,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Returned by a successful run submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReceipt {
    pub run_id: String,
    pub job_names: Vec<String>,
}

/// Branch for an agent lane. Unique within a run because it derives from the index.
pub fn branch_name(agent_id: u32) -> String {
    format!("agent-{}", agent_id)
}

/// Job name for a lane stage. Unique across runs because it embeds the run id.
pub fn job_name(run_id: &str, agent_id: u32, stage: Stage) -> String {
    format!("fanout-{}-{}-{}", run_id, agent_id, stage.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn st(stage: Stage, status: LaneStatus) -> LaneState {
        LaneState::new(stage, status)
    }

    #[test]
    fn test_stage_order_and_next() {
        assert!(Stage::Worker < Stage::Reviewer);
        assert!(Stage::Reviewer < Stage::Committer);
        assert_eq!(Stage::Worker.next(), Some(Stage::Reviewer));
        assert_eq!(Stage::Reviewer.next(), Some(Stage::Committer));
        assert_eq!(Stage::Committer.next(), None);
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("worker".parse::<Stage>().unwrap(), Stage::Worker);
        assert_eq!("REVIEWER".parse::<Stage>().unwrap(), Stage::Reviewer);
        assert!("merger".parse::<Stage>().is_err());
        for stage in Stage::all() {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), *stage);
        }
    }

    #[test]
    fn test_valid_forward_transitions() {
        use LaneStatus::*;
        use Stage::*;
        assert!(is_valid_transition(&st(Worker, Running), &st(Worker, Done)));
        assert!(is_valid_transition(&st(Worker, Done), &st(Reviewer, Running)));
        assert!(is_valid_transition(&st(Reviewer, Running), &st(Reviewer, Done)));
        assert!(is_valid_transition(&st(Reviewer, Done), &st(Committer, Running)));
        assert!(is_valid_transition(&st(Reviewer, Done), &st(Committer, Skipped)));
        assert!(is_valid_transition(&st(Committer, Running), &st(Committer, Done)));
        assert!(is_valid_transition(&st(Committer, Running), &st(Committer, Skipped)));
    }

    #[test]
    fn test_failed_from_running_or_awaiting_handoff() {
        use LaneStatus::*;
        use Stage::*;
        assert!(is_valid_transition(&st(Worker, Running), &st(Worker, Failed)));
        assert!(is_valid_transition(&st(Reviewer, Running), &st(Reviewer, Failed)));
        assert!(is_valid_transition(&st(Committer, Running), &st(Committer, Failed)));
        // the job of a finished stage can still exit non-zero
        assert!(is_valid_transition(&st(Worker, Done), &st(Worker, Failed)));
        assert!(is_valid_transition(&st(Reviewer, Done), &st(Reviewer, Failed)));
        assert!(!is_valid_transition(&st(Worker, Done), &st(Reviewer, Failed)));
        assert!(!is_valid_transition(&st(Worker, Running), &st(Reviewer, Failed)));
        assert!(!is_valid_transition(&st(Committer, Done), &st(Committer, Failed)));
        assert!(!is_valid_transition(&st(Committer, Skipped), &st(Committer, Failed)));
    }

    #[test]
    fn test_invalid_transitions() {
        use LaneStatus::*;
        use Stage::*;
        // skipping the reviewer
        assert!(!is_valid_transition(&st(Worker, Done), &st(Committer, Running)));
        assert!(!is_valid_transition(&st(Worker, Running), &st(Reviewer, Running)));
        // regressions
        assert!(!is_valid_transition(&st(Reviewer, Running), &st(Worker, Running)));
        assert!(!is_valid_transition(&st(Committer, Done), &st(Committer, Running)));
        // terminal states
        assert!(!is_valid_transition(&st(Worker, Failed), &st(Reviewer, Running)));
        assert!(!is_valid_transition(&st(Committer, Skipped), &st(Committer, Done)));
        // skipped only exists for the committer
        assert!(!is_valid_transition(&st(Worker, Running), &st(Worker, Skipped)));
        // re-running the same state
        assert!(!is_valid_transition(&st(Worker, Running), &st(Worker, Running)));
    }

    #[test]
    fn test_terminal_states() {
        assert!(st(Stage::Committer, LaneStatus::Done).is_terminal());
        assert!(st(Stage::Committer, LaneStatus::Skipped).is_terminal());
        assert!(st(Stage::Worker, LaneStatus::Failed).is_terminal());
        assert!(!st(Stage::Worker, LaneStatus::Done).is_terminal());
        assert!(!st(Stage::Committer, LaneStatus::Running).is_terminal());
    }

    #[test]
    fn test_names_are_derived_from_indices() {
        assert_eq!(branch_name(3), "agent-3");
        assert_eq!(job_name("ab12cd34", 3, Stage::Reviewer), "fanout-ab12cd34-3-reviewer");
        assert_ne!(
            job_name("ab12cd34", 1, Stage::Worker),
            job_name("ab12cd34", 10, Stage::Worker)
        );
    }

    #[test]
    fn test_pod_log_serialization_omits_missing_side() {
        let ok = serde_json::to_value(PodLog::ok("unit-a", "hello")).unwrap();
        assert_eq!(ok["log"], "hello");
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(PodLog::failed("unit-b", "boom")).unwrap();
        assert_eq!(failed["error"], "boom");
        assert!(failed.get("log").is_none());
    }
}
