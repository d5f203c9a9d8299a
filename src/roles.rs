//! Role profiles for the three pipeline stages.
//!
//! Everything that differs between worker, reviewer and committer jobs lives in
//! [`ROLE_PROFILES`]; the job spec builder and the settings writer only read it.

use std::path::Path;

use crate::models::Stage;
use crate::review::REVIEW_ARTIFACT;
use crate::workspace::TRUNK_BRANCH;

/// Where a role's job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkdirRule {
    /// The lane's own worktree (its branch is checked out there).
    LaneWorktree,
    /// The run repository's trunk checkout.
    TrunkCheckout,
}

/// How a job signals that its stage is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerWiring {
    /// Post-tool hook on the given tool that fires after a `git commit`.
    OnCommit { tool_matcher: &'static str },
    /// No hook; the stage is resolved from job status.
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct RoleProfile {
    pub stage: Stage,
    pub workdir: WorkdirRule,
    /// Used when the caller supplies no prompt. `None` means a prompt is required.
    pub default_prompt: Option<&'static str>,
    /// Appended to the agent's system prompt. See [`render_framing`] for placeholders.
    pub framing: &'static str,
    pub trigger: TriggerWiring,
    pub max_turns: u32,
}

const WORKER_FRAMING: &str = "\
You are autonomous agent #{agent_id} in a group of agents working on the same task in \
parallel. Your working directory is a git worktree with branch `{branch}` checked out. \
Only modify files inside it and never switch branches.

Complete the task independently and thoroughly. When you are finished, stage every change \
and commit it to `{branch}` with a descriptive message. That commit must be your final \
action: committing signals that your work is ready for review.";

const REVIEWER_PROMPT: &str = "Review the latest commit on this branch.";

const REVIEWER_FRAMING: &str = "\
You are the reviewer for agent #{agent_id}. Your working directory is the worktree for \
branch `{branch}`.

1. Inspect the changes on this branch with `git diff {trunk}...HEAD`.
2. Fix any defects you find directly in the worktree.
3. Write `{artifact}` at the worktree root summarising what you checked and changed. \
Include exactly one line of the form `Verdict: approved` or `Verdict: needs-work`.
4. Commit all changes including `{artifact}` to `{branch}` as your final action.";

const COMMITTER_PROMPT: &str = "Merge the reviewed branch into trunk if its review approves it.";

const COMMITTER_FRAMING: &str = "\
You are the committer for agent #{agent_id}. Your working directory is the trunk checkout \
with `{trunk}` checked out. Branch `{branch}` is ready for integration.

1. Run `git show {branch}:{artifact}` and confirm the file exists and its `Verdict:` line \
says `approved`. If it does not, stop without changing anything.
2. Immediately before merging, check that the working tree is clean and `{trunk}` is \
checked out.
3. Run `git merge --no-ff {branch}`.
4. If the merge reports conflicts, run `git merge --abort` and stop. Never resolve \
conflicts and never leave `{trunk}` in a conflicted state.";

pub static ROLE_PROFILES: [RoleProfile; 3] = [
    RoleProfile {
        stage: Stage::Worker,
        workdir: WorkdirRule::LaneWorktree,
        default_prompt: None,
        framing: WORKER_FRAMING,
        trigger: TriggerWiring::OnCommit {
            tool_matcher: "Bash",
        },
        max_turns: 50,
    },
    RoleProfile {
        stage: Stage::Reviewer,
        workdir: WorkdirRule::LaneWorktree,
        default_prompt: Some(REVIEWER_PROMPT),
        framing: REVIEWER_FRAMING,
        trigger: TriggerWiring::OnCommit {
            tool_matcher: "Bash",
        },
        max_turns: 30,
    },
    RoleProfile {
        stage: Stage::Committer,
        workdir: WorkdirRule::TrunkCheckout,
        default_prompt: Some(COMMITTER_PROMPT),
        framing: COMMITTER_FRAMING,
        trigger: TriggerWiring::None,
        max_turns: 20,
    },
];

pub fn profile(stage: Stage) -> &'static RoleProfile {
    match stage {
        Stage::Worker => &ROLE_PROFILES[0],
        Stage::Reviewer => &ROLE_PROFILES[1],
        Stage::Committer => &ROLE_PROFILES[2],
    }
}

impl RoleProfile {
    pub fn workdir<'a>(&self, worktree_path: &'a Path, trunk_path: &'a Path) -> &'a Path {
        match self.workdir {
            WorkdirRule::LaneWorktree => worktree_path,
            WorkdirRule::TrunkCheckout => trunk_path,
        }
    }
}

/// Fill the framing placeholders: `{agent_id}`, `{branch}`, `{trunk}`, `{artifact}`.
pub fn render_framing(profile: &RoleProfile, agent_id: u32, branch: &str) -> String {
    profile
        .framing
        .replace("{agent_id}", &agent_id.to_string())
        .replace("{branch}", branch)
        .replace("{trunk}", TRUNK_BRANCH)
        .replace("{artifact}", REVIEW_ARTIFACT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_every_stage_in_order() {
        for stage in Stage::all() {
            assert_eq!(profile(*stage).stage, *stage);
        }
    }

    #[test]
    fn test_workdir_rules() {
        let wt = Path::new("/out/run-1/agent-0");
        let trunk = Path::new("/out/run-1/repo");
        assert_eq!(profile(Stage::Worker).workdir(wt, trunk), wt);
        assert_eq!(profile(Stage::Reviewer).workdir(wt, trunk), wt);
        assert_eq!(profile(Stage::Committer).workdir(wt, trunk), trunk);
    }

    #[test]
    fn test_only_committer_lacks_trigger() {
        assert!(matches!(
            profile(Stage::Worker).trigger,
            TriggerWiring::OnCommit { .. }
        ));
        assert!(matches!(
            profile(Stage::Reviewer).trigger,
            TriggerWiring::OnCommit { .. }
        ));
        assert_eq!(profile(Stage::Committer).trigger, TriggerWiring::None);
    }

    #[test]
    fn test_worker_requires_prompt() {
        assert!(profile(Stage::Worker).default_prompt.is_none());
        assert_eq!(
            profile(Stage::Reviewer).default_prompt,
            Some("Review the latest commit on this branch.")
        );
    }

    #[test]
    fn test_render_framing_fills_placeholders() {
        for stage in Stage::all() {
            let text = render_framing(profile(*stage), 3, "agent-3");
            assert!(!text.contains('{'), "unfilled placeholder in {}", stage);
        }
        let committer = render_framing(profile(Stage::Committer), 3, "agent-3");
        assert!(committer.contains("git merge --no-ff agent-3"));
        assert!(committer.contains("git show agent-3:review-details.md"));
        assert!(committer.contains("git merge --abort"));

        let reviewer = render_framing(profile(Stage::Reviewer), 1, "agent-1");
        assert!(reviewer.contains("git diff main...HEAD"));
        assert!(reviewer.contains("Verdict: needs-work"));
    }
}
