//! Job spec builder.
//!
//! Turns (role, lane, prompt) into a fully specified, substrate-neutral job
//! descriptor. Building is pure: the same request against the same builder
//! always yields the same spec, and nothing is submitted here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{FanoutConfig, ResourceEnvelope};
use crate::errors::OrchestratorError;
use crate::models::{Stage, job_name};
use crate::roles::{self, RoleProfile};

pub const LABEL_APP: &str = "app";
pub const LABEL_JOB_GROUP: &str = "job-group";
pub const LABEL_JOB_NAME: &str = "job-name";
pub const LABEL_AGENT_ID: &str = "agent-id";
pub const LABEL_STAGE: &str = "stage";

/// Everything needed to build one stage's job for one lane.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub stage: Stage,
    pub run_id: String,
    pub agent_id: u32,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub trunk_path: PathBuf,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartPolicy {
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

/// Substrate-neutral job descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub name: String,
    pub run_id: String,
    pub agent_id: u32,
    pub stage: Stage,
    pub image: String,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub resources: ResourceEnvelope,
    pub restart_policy: RestartPolicy,
    pub ttl_seconds_after_finished: u64,
    pub run_as_user: u32,
    pub allow_privilege_escalation: bool,
    pub volume: VolumeMount,
    pub network: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobSpecBuilder {
    image: String,
    app_label: String,
    ttl_seconds_after_finished: u64,
    run_as_user: u32,
    resources: ResourceEnvelope,
    callback_url: String,
    volume: VolumeMount,
    network: Option<String>,
    /// Secrets copied into every job, resolved once at startup.
    passthrough: BTreeMap<String, String>,
}

impl JobSpecBuilder {
    /// Build from configuration, resolving pass-through variables with `lookup`.
    /// Variables that are unset are skipped.
    pub fn from_config<F>(config: &FanoutConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let passthrough = config
            .jobs
            .passthrough_env
            .iter()
            .filter_map(|key| lookup(key).map(|value| (key.clone(), value)))
            .collect();

        Self {
            image: config.jobs.image.clone(),
            app_label: config.jobs.app_label.clone(),
            ttl_seconds_after_finished: config.jobs.ttl_seconds_after_finished,
            run_as_user: config.jobs.run_as_user,
            resources: config.jobs.resources.clone(),
            callback_url: config.trigger.callback_url.clone(),
            volume: VolumeMount {
                host_path: config.volume_host_path(),
                container_path: config.storage.output_base.clone(),
            },
            network: config.jobs.network.clone(),
            passthrough,
        }
    }

    pub fn build(&self, request: &JobRequest) -> Result<JobSpec, OrchestratorError> {
        let profile = roles::profile(request.stage);
        let prompt = resolve_prompt(profile, request.prompt.as_deref())?;

        if request.branch.trim().is_empty() {
            return Err(OrchestratorError::validation("Branch name must not be empty"));
        }
        for path in [&request.worktree_path, &request.trunk_path] {
            if !path.is_absolute() {
                return Err(OrchestratorError::validation(format!(
                    "Workspace path must be absolute: {}",
                    path.display()
                )));
            }
        }

        let name = job_name(&request.run_id, request.agent_id, request.stage);
        let workdir = profile
            .workdir(&request.worktree_path, &request.trunk_path)
            .to_path_buf();

        let mut env = self.passthrough.clone();
        let mut set = |key: &str, value: String| {
            env.insert(key.to_string(), value);
        };
        set("AGENT_ROLE", request.stage.as_str().to_string());
        set("JOB_GROUP_ID", request.run_id.clone());
        set("AGENT_ID", request.agent_id.to_string());
        set("AGENT_BRANCH", request.branch.clone());
        set(
            "AGENT_WORKTREE_PATH",
            request.worktree_path.display().to_string(),
        );
        set("AGENT_WORKDIR", workdir.display().to_string());
        set("AGENT_PROMPT", prompt);
        set(
            "AGENT_SYSTEM_APPEND",
            roles::render_framing(profile, request.agent_id, &request.branch),
        );
        set("AGENT_MAX_TURNS", profile.max_turns.to_string());
        set("FANOUT_CALLBACK_URL", self.callback_url.clone());
        if profile.workdir == roles::WorkdirRule::TrunkCheckout {
            set("TRUNK_PATH", request.trunk_path.display().to_string());
        }

        let labels = BTreeMap::from([
            (LABEL_APP.to_string(), self.app_label.clone()),
            (LABEL_JOB_GROUP.to_string(), request.run_id.clone()),
            (LABEL_JOB_NAME.to_string(), name.clone()),
            (LABEL_AGENT_ID.to_string(), request.agent_id.to_string()),
            (LABEL_STAGE.to_string(), request.stage.as_str().to_string()),
        ]);

        Ok(JobSpec {
            name,
            run_id: request.run_id.clone(),
            agent_id: request.agent_id,
            stage: request.stage,
            image: self.image.clone(),
            workdir,
            env,
            labels,
            resources: self.resources.clone(),
            restart_policy: RestartPolicy::Never,
            ttl_seconds_after_finished: self.ttl_seconds_after_finished,
            run_as_user: self.run_as_user,
            allow_privilege_escalation: false,
            volume: self.volume.clone(),
            network: self.network.clone(),
        })
    }

    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn volume_container_path(&self) -> &Path {
        &self.volume.container_path
    }
}

fn resolve_prompt(profile: &RoleProfile, prompt: Option<&str>) -> Result<String, OrchestratorError> {
    match prompt.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => Ok(p.to_string()),
        None => profile.default_prompt.map(str::to_string).ok_or_else(|| {
            OrchestratorError::validation(format!(
                "A prompt is required for the {} stage",
                profile.stage
            ))
        }),
    }
}
