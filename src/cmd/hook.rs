//! Agent-side hook, `fanout hook`.
//!
//! Installed as a post-tool-use hook in worker and reviewer worktrees. Reads
//! the tool event from stdin and, when it was a `git commit`, tells the
//! orchestrator the stage is complete.

use anyhow::{Context, Result};
use fanout::config::LoggingSection;
use fanout::logging;
use fanout::models::Stage;
use fanout::trigger::{self, TriggerClient};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

/// Never fails: a broken hook must not interrupt the agent.
pub async fn cmd_hook(stage: Option<&str>) {
    let quiet = LoggingSection {
        level: "warn".to_string(),
        ..LoggingSection::default()
    };
    let _guard = match logging::init(&quiet) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("fanout hook: logging unavailable: {:#}", e);
            None
        }
    };

    if let Err(e) = run_hook(stage).await {
        warn!(error = %format!("{:#}", e), "Stage signal not delivered");
    }
}

async fn run_hook(stage: Option<&str>) -> Result<()> {
    let stage_override = stage
        .map(str::parse::<Stage>)
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read tool event from stdin")?;

    let Some(signal) =
        trigger::signal_for_event(&input, stage_override, |key| std::env::var(key).ok())?
    else {
        return Ok(());
    };

    let url = std::env::var("FANOUT_CALLBACK_URL").context("FANOUT_CALLBACK_URL is not set")?;
    let status = TriggerClient::new(&url)?.send(&signal).await?;
    info!(run_id = %signal.run_id, agent_id = signal.agent_id, stage = %signal.stage, status = %status, "Stage signal delivered");
    Ok(())
}
