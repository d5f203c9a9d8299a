//! Docker substrate: one container per job.
//!
//! Job metadata lives entirely in container labels, so the backend keeps no
//! state of its own and survives orchestrator restarts.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerStateStatusEnum, HostConfig,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::JobBackend;
use crate::jobs::{JobSpec, LABEL_APP, LABEL_JOB_GROUP, LABEL_JOB_NAME};
use crate::models::{JobState, JobStatus};
use crate::workspace::RunLayout;

pub const LABEL_TTL: &str = "ttl-seconds-after-finished";

/// Docker reports this for containers that never started or never finished.
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

pub struct DockerBackend {
    docker: Docker,
    app_label: String,
}

impl DockerBackend {
    pub fn connect(app_label: &str) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            app_label: app_label.to_string(),
        })
    }

    async fn containers_with_labels(&self, labels: &[(&str, &str)]) -> Result<Vec<String>> {
        let mut label_filters = vec![format!("{}={}", LABEL_APP, self.app_label)];
        label_filters.extend(labels.iter().map(|(k, v)| format!("{}={}", k, v)));
        let filters = HashMap::from([("label".to_string(), label_filters)]);

        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", name))
    }

    async fn collect_logs(&self, name: &str) -> Result<String> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .timestamps(false)
            .build();
        let mut stream = self.docker.logs(name, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to read logs of {}", name))?;
            match chunk {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(text)
    }
}

/// Translate a job spec into a container definition.
pub fn container_body(spec: &JobSpec) -> Result<ContainerCreateBody> {
    let resources = &spec.resources;
    let memory_limit = resources.memory_limit_bytes()?;
    let memory_request = resources.memory_request_bytes()?;
    let cpu_limit = resources.cpu_limit_nanos()?;
    let cpu_request = resources.cpu_request_nanos()?;

    let mut labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(
        LABEL_TTL.to_string(),
        spec.ttl_seconds_after_finished.to_string(),
    );

    let mut security_opt = Vec::new();
    if !spec.allow_privilege_escalation {
        security_opt.push("no-new-privileges".to_string());
    }

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}",
            spec.volume.host_path.display(),
            spec.volume.container_path.display()
        )]),
        memory: Some(memory_limit),
        memory_reservation: Some(memory_request),
        nano_cpus: Some(cpu_limit),
        // Relative weight; 1024 is one full CPU.
        cpu_shares: Some(cpu_request * 1024 / 1_000_000_000),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        security_opt: Some(security_opt),
        network_mode: spec.network.clone(),
        ..Default::default()
    };

    Ok(ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        labels: Some(labels),
        working_dir: Some(spec.workdir.display().to_string()),
        user: Some(spec.run_as_user.to_string()),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Classify a container from its inspected state.
pub fn classify(
    status: Option<ContainerStateStatusEnum>,
    exit_code: Option<i64>,
    oom_killed: bool,
) -> JobState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => JobState::Pending,
        Some(
            ContainerStateStatusEnum::RUNNING
            | ContainerStateStatusEnum::PAUSED
            | ContainerStateStatusEnum::RESTARTING,
        ) => JobState::Running,
        Some(ContainerStateStatusEnum::EXITED) => {
            if !oom_killed && exit_code == Some(0) {
                JobState::Completed
            } else {
                JobState::Failed
            }
        }
        Some(ContainerStateStatusEnum::DEAD) => JobState::Failed,
        _ => JobState::Unknown,
    }
}

fn real_time(value: Option<String>) -> Option<String> {
    value.filter(|t| !t.is_empty() && t != ZERO_TIME)
}

fn job_status(name: &str, info: ContainerInspectResponse) -> JobStatus {
    let labels = info.config.and_then(|c| c.labels).unwrap_or_default();
    let job_name = labels
        .get(LABEL_JOB_NAME)
        .cloned()
        .unwrap_or_else(|| name.to_string());

    let Some(state) = info.state else {
        return JobStatus {
            name: job_name,
            state: JobState::Unknown,
            start_time: None,
            completion_time: None,
        };
    };
    let job_state = classify(
        state.status,
        state.exit_code,
        state.oom_killed.unwrap_or(false),
    );
    JobStatus {
        name: job_name,
        state: job_state,
        start_time: real_time(state.started_at),
        completion_time: if job_state == JobState::Completed {
            real_time(state.finished_at)
        } else {
            None
        },
    }
}

#[async_trait]
impl JobBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<()> {
        let body = container_body(spec)?;
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", spec.name))?;
        info!(job = %spec.name, image = %spec.image, "Started job container");
        Ok(())
    }

    async fn list_jobs(&self, run_id: &str) -> Result<Vec<JobStatus>> {
        let names = self
            .containers_with_labels(&[(LABEL_JOB_GROUP, run_id)])
            .await?;
        let mut jobs = Vec::with_capacity(names.len());
        for name in names {
            match self.inspect(&name).await {
                Ok(info) => jobs.push(job_status(&name, info)),
                // Removed between list and inspect.
                Err(e) => debug!(container = %name, error = %e, "Skipping container"),
            }
        }
        Ok(jobs)
    }

    async fn list_units(&self, job_name: &str) -> Result<Vec<String>> {
        self.containers_with_labels(&[(LABEL_JOB_NAME, job_name)])
            .await
    }

    async fn unit_log(&self, unit: &str) -> Result<String> {
        self.collect_logs(unit).await
    }

    async fn reap_finished(&self, output_base: &Path) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut reaped = Vec::new();

        for name in self.containers_with_labels(&[]).await? {
            let info = match self.inspect(&name).await {
                Ok(info) => info,
                Err(e) => {
                    debug!(container = %name, error = %e, "Skipping container");
                    continue;
                }
            };
            let labels = info
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default();
            let Some(state) = info.state.as_ref() else {
                continue;
            };
            if !matches!(
                state.status,
                Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD)
            ) {
                continue;
            }
            let Some(finished) = real_time(state.finished_at.clone())
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc))
            else {
                continue;
            };
            let ttl: i64 = labels
                .get(LABEL_TTL)
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600);
            if finished + chrono::Duration::seconds(ttl) > now {
                continue;
            }

            let job_name = labels.get(LABEL_JOB_NAME).cloned().unwrap_or(name.clone());
            if let Some(run_id) = labels.get(LABEL_JOB_GROUP) {
                let logs_dir = RunLayout::new(output_base, run_id).logs_dir;
                let archived = async {
                    let text = self.collect_logs(&name).await?;
                    tokio::fs::create_dir_all(&logs_dir).await?;
                    tokio::fs::write(logs_dir.join(format!("{}.log", job_name)), text).await?;
                    anyhow::Ok(())
                }
                .await;
                if let Err(e) = archived {
                    // Keep the container so its logs are not lost.
                    warn!(container = %name, error = %format!("{:#}", e), "Failed to archive logs");
                    continue;
                }
            }

            let options = RemoveContainerOptionsBuilder::new().force(true).build();
            match self.docker.remove_container(&name, Some(options)).await {
                Ok(()) => {
                    info!(job = %job_name, "Reaped finished job");
                    reaped.push(job_name);
                }
                Err(e) => warn!(container = %name, error = %e, "Failed to remove container"),
            }
        }
        Ok(reaped)
    }
}
