//! Run-scoped repositories and per-agent worktrees.
//!
//! Layout under the shared output volume:
//!
//! ```text
//! <output_base>/run-<run_id>/
//!     repo/        trunk checkout (branch `main`), written only by committers
//!     agent-0/     worktree on branch agent-0
//!     agent-1/     worktree on branch agent-1
//!     logs/        archived job logs
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{
    BranchType, ErrorCode, Repository, RepositoryInitOptions, Signature, WorktreeAddOptions,
};
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::models::branch_name;
use crate::review::REVIEW_ARTIFACT;

pub const TRUNK_BRANCH: &str = "main";

const AGENT_NAME: &str = "Fanout Agent";
const AGENT_EMAIL: &str = "agent@fanout.local";

/// Directory that role settings are written to inside a worktree. Excluded from
/// every commit via the repository's `info/exclude`.
pub const SETTINGS_DIR: &str = ".claude";

/// Paths belonging to one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub run_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl RunLayout {
    pub fn new(output_base: &Path, run_id: &str) -> Self {
        let run_dir = output_base.join(format!("run-{}", run_id));
        Self {
            repo_dir: run_dir.join("repo"),
            logs_dir: run_dir.join("logs"),
            run_dir,
        }
    }

    pub fn worktree_path(&self, agent_id: u32) -> PathBuf {
        self.run_dir.join(branch_name(agent_id))
    }
}

/// A lane as created on disk, before the coordinator persists it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedLane {
    pub agent_id: u32,
    pub branch: String,
    pub worktree_path: PathBuf,
}

/// Committed review artifact on a lane branch.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactLookup {
    Missing,
    /// Present, but identical to what the branch held before the reviewer started.
    Unchanged,
    Present(String),
}

/// Creates and inspects run repositories. All methods are blocking; async
/// callers run them on the blocking pool.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    output_base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(output_base: impl Into<PathBuf>) -> Self {
        Self {
            output_base: output_base.into(),
        }
    }

    pub fn output_base(&self) -> &Path {
        &self.output_base
    }

    pub fn layout(&self, run_id: &str) -> RunLayout {
        RunLayout::new(&self.output_base, run_id)
    }

    /// Create the run directory, its repository with one seed commit, and one
    /// branch + worktree per agent.
    ///
    /// On failure everything created for the run is removed, so no lane is left
    /// half-provisioned.
    pub fn provision(
        &self,
        run_id: &str,
        agent_count: u32,
    ) -> Result<Vec<ProvisionedLane>, OrchestratorError> {
        let layout = self.layout(run_id);
        if layout.run_dir.exists() {
            return Err(OrchestratorError::Setup(anyhow::anyhow!(
                "Run directory {} already exists",
                layout.run_dir.display()
            )));
        }

        match self.provision_inner(run_id, &layout, agent_count) {
            Ok(lanes) => Ok(lanes),
            Err(e) => {
                warn!(run_id, error = %format!("{:#}", e), "Workspace setup failed, removing run directory");
                if let Err(cleanup) = std::fs::remove_dir_all(&layout.run_dir)
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(run_id, error = %cleanup, "Failed to remove partial run directory");
                }
                Err(OrchestratorError::Setup(e))
            }
        }
    }

    fn provision_inner(
        &self,
        run_id: &str,
        layout: &RunLayout,
        agent_count: u32,
    ) -> Result<Vec<ProvisionedLane>> {
        std::fs::create_dir_all(&layout.repo_dir)
            .with_context(|| format!("Failed to create {}", layout.repo_dir.display()))?;

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(TRUNK_BRANCH);
        let repo = Repository::init_opts(&layout.repo_dir, &opts)
            .context("Failed to initialize run repository")?;

        {
            let mut config = repo.config().context("Failed to open repository config")?;
            config.set_str("user.email", AGENT_EMAIL)?;
            config.set_str("user.name", AGENT_NAME)?;
        }

        exclude_settings_dir(&repo)?;

        // A repository with zero commits cannot branch.
        std::fs::write(
            layout.repo_dir.join("README.md"),
            format!("# Run {}\n\nMulti-agent run.\n", run_id),
        )
        .context("Failed to write seed README")?;
        let mut index = repo.index()?;
        index.add_path(Path::new("README.md"))?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = Signature::now(AGENT_NAME, AGENT_EMAIL)?;
        let seed_id = repo
            .commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .context("Failed to create seed commit")?;
        let seed = repo.find_commit(seed_id)?;
        debug!(run_id, seed = %seed_id, "Created seed commit");

        let mut lanes = Vec::with_capacity(agent_count as usize);
        for agent_id in 0..agent_count {
            let branch = branch_name(agent_id);
            let worktree_path = layout.worktree_path(agent_id);

            let reference = repo
                .branch(&branch, &seed, false)
                .with_context(|| format!("Failed to create branch {}", branch))?
                .into_reference();
            let mut wt_opts = WorktreeAddOptions::new();
            wt_opts.reference(Some(&reference));
            repo.worktree(&branch, &worktree_path, Some(&wt_opts))
                .with_context(|| {
                    format!("Failed to add worktree at {}", worktree_path.display())
                })?;

            info!(run_id, agent_id, branch = %branch, worktree = %worktree_path.display(), "Created worktree");
            lanes.push(ProvisionedLane {
                agent_id,
                branch,
                worktree_path,
            });
        }

        std::fs::create_dir_all(&layout.logs_dir)
            .with_context(|| format!("Failed to create {}", layout.logs_dir.display()))?;

        Ok(lanes)
    }

    fn open(&self, run_id: &str) -> Result<Repository> {
        let repo_dir = self.layout(run_id).repo_dir;
        Repository::open(&repo_dir)
            .with_context(|| format!("Failed to open run repository {}", repo_dir.display()))
    }

    /// Current commit of a lane branch.
    pub fn branch_head(&self, run_id: &str, branch: &str) -> Result<String> {
        let repo = self.open(run_id)?;
        let commit = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch {} not found", branch))?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Read the review artifact committed at the tip of `branch`.
    ///
    /// With `since`, an artifact whose blob is identical at that commit is
    /// reported as `Unchanged`: only content committed after the reviewer
    /// started counts.
    pub fn read_review_artifact(
        &self,
        run_id: &str,
        branch: &str,
        since: Option<&str>,
    ) -> Result<ArtifactLookup> {
        let repo = self.open(run_id)?;
        let tip = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch {} not found", branch))?
            .get()
            .peel_to_commit()?;
        let tree = tip.tree()?;

        let entry = match tree.get_path(Path::new(REVIEW_ARTIFACT)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(ArtifactLookup::Missing),
            Err(e) => return Err(e.into()),
        };

        if let Some(since) = since {
            let base = repo.find_commit(git2::Oid::from_str(since)?)?;
            if let Ok(base_entry) = base.tree()?.get_path(Path::new(REVIEW_ARTIFACT))
                && base_entry.id() == entry.id()
            {
                return Ok(ArtifactLookup::Unchanged);
            }
        }

        let blob = repo.find_blob(entry.id())?;
        Ok(ArtifactLookup::Present(
            String::from_utf8_lossy(blob.content()).to_string(),
        ))
    }

    /// Whether the tip of `branch` is reachable from trunk.
    pub fn is_merged_into_trunk(&self, run_id: &str, branch: &str) -> Result<bool> {
        let repo = self.open(run_id)?;
        let trunk = repo
            .find_branch(TRUNK_BRANCH, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        let tip = repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch {} not found", branch))?
            .get()
            .peel_to_commit()?
            .id();
        Ok(trunk == tip || repo.graph_descendant_of(trunk, tip)?)
    }
}

/// Keep role settings out of every branch. Worktrees share the common
/// `info/exclude` of the main repository.
fn exclude_settings_dir(repo: &Repository) -> Result<()> {
    let info_dir = repo.path().join("info");
    std::fs::create_dir_all(&info_dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(info_dir.join("exclude"))
        .context("Failed to open info/exclude")?;
    writeln!(file, "{}/", SETTINGS_DIR)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers that play the part of agents committing on their branches.

    use super::*;

    /// Write `files` into `dir` (a worktree or the trunk checkout) and commit
    /// them onto the branch checked out there.
    pub fn commit_files(dir: &Path, files: &[(&str, &str)], message: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        let mut index = repo.index().unwrap();
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
            index.add_path(Path::new(name)).unwrap();
        }
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .unwrap()
            .to_string()
    }
}
