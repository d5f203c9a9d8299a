//! Stage trigger protocol.
//!
//! Runs inside a job as the post-tool hook. It reads the tool event from stdin
//! and, when the tool call was a `git commit`, posts a [`StageSignal`] to the
//! orchestrator. Nothing here may block the agent: every failure is logged and
//! swallowed by the caller.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::Stage;

pub const SIGNAL_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// `git commit`, optionally with `-C <dir>` or `-c k=v`, at the start of any
// command in a shell pipeline or list.
static GIT_COMMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[;&|(]\s*|\n\s*)git(?:\s+-[Cc]\s+\S+)*\s+commit(?:\s|$)").unwrap()
});

/// Completion signal for one stage of one lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSignal {
    pub run_id: String,
    pub agent_id: u32,
    pub stage: Stage,
}

/// The subset of the post-tool event we look at.
#[derive(Debug, Deserialize)]
pub struct ToolEvent {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

impl ToolEvent {
    pub fn command(&self) -> Option<&str> {
        self.tool_input.get("command").and_then(|c| c.as_str())
    }
}

pub fn is_commit_command(command: &str) -> bool {
    GIT_COMMIT.is_match(command.trim_start())
}

/// Decide whether a tool event should produce a signal.
///
/// Returns `Ok(None)` for events that are not commits, and an error only when
/// the job environment is incomplete.
pub fn signal_for_event<F>(
    event_json: &str,
    stage_override: Option<Stage>,
    env: F,
) -> Result<Option<StageSignal>>
where
    F: Fn(&str) -> Option<String>,
{
    let event: ToolEvent = match serde_json::from_str(event_json) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable tool event");
            return Ok(None);
        }
    };

    if event.tool_name != "Bash" {
        return Ok(None);
    }
    let Some(command) = event.command() else {
        return Ok(None);
    };
    if !is_commit_command(command) {
        return Ok(None);
    }

    let run_id = env("JOB_GROUP_ID").context("JOB_GROUP_ID is not set")?;
    let agent_id = env("AGENT_ID")
        .context("AGENT_ID is not set")?
        .parse::<u32>()
        .context("AGENT_ID is not a number")?;
    let stage = match stage_override {
        Some(stage) => stage,
        None => env("AGENT_ROLE")
            .context("AGENT_ROLE is not set")?
            .parse::<Stage>()
            .map_err(anyhow::Error::msg)?,
    };

    Ok(Some(StageSignal {
        run_id,
        agent_id,
        stage,
    }))
}

fn backoff(base: Duration, retry: u32) -> Duration {
    base * 2u32.pow(retry)
}

/// Client for the orchestrator's trigger endpoint.
pub struct TriggerClient {
    http: reqwest::Client,
    endpoint: String,
    attempts: u32,
    base_delay: Duration,
}

impl TriggerClient {
    pub fn new(callback_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/trigger", callback_url.trim_end_matches('/')),
            attempts: SIGNAL_ATTEMPTS,
            base_delay: BASE_BACKOFF,
        })
    }

    #[cfg(test)]
    fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Post the signal, retrying on transport errors and 5xx responses.
    ///
    /// A 4xx answer is final: the orchestrator understood and rejected the
    /// signal (duplicate or stale), so retrying cannot help.
    pub async fn send(&self, signal: &StageSignal) -> Result<reqwest::StatusCode> {
        let mut last_error = None;
        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff(self.base_delay, attempt - 1)).await;
            }
            match self.http.post(&self.endpoint).json(signal).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(attempt, status = %resp.status(), "Trigger endpoint returned server error");
                    last_error = Some(anyhow::anyhow!("server error {}", resp.status()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        info!(run_id = %signal.run_id, agent_id = signal.agent_id, stage = %signal.stage, "Stage signal accepted");
                    } else {
                        warn!(run_id = %signal.run_id, agent_id = signal.agent_id, stage = %signal.stage, status = %status, "Stage signal rejected");
                    }
                    return Ok(status);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to reach trigger endpoint");
                    last_error = Some(e.into());
                }
            }
        }
        match last_error {
            Some(e) => Err(e.context(format!(
                "Giving up on {} after {} attempts",
                self.endpoint, self.attempts
            ))),
            None => bail!("No attempts configured"),
        }
    }
}
