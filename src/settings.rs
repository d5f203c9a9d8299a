//! Agent settings artifact written into a lane worktree before a job starts.
//!
//! The settings declare a post-tool hook that runs `fanout hook` after every
//! shell tool call; the hook itself decides whether the call was a commit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::Stage;
use crate::roles::{self, TriggerWiring};
use crate::workspace::SETTINGS_DIR;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub hooks: HookTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTable {
    #[serde(rename = "PostToolUse", default)]
    pub post_tool_use: Vec<HookMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookMatcher {
    pub matcher: String,
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
}

pub fn settings_path(worktree: &Path) -> PathBuf {
    worktree.join(SETTINGS_DIR).join(SETTINGS_FILE)
}

/// Settings for a stage, or `None` when the role has no trigger wiring.
pub fn settings_for(stage: Stage, hook_command: &str) -> Option<AgentSettings> {
    match roles::profile(stage).trigger {
        TriggerWiring::OnCommit { tool_matcher } => Some(AgentSettings {
            hooks: HookTable {
                post_tool_use: vec![HookMatcher {
                    matcher: tool_matcher.to_string(),
                    hooks: vec![HookCommand {
                        kind: "command".to_string(),
                        command: format!("{} --stage {}", hook_command, stage),
                    }],
                }],
            },
        }),
        TriggerWiring::None => None,
    }
}

/// Write (or replace) the settings for `stage` in `worktree`.
///
/// Returns false without touching the filesystem when the role has no trigger.
pub fn write_settings(worktree: &Path, stage: Stage, hook_command: &str) -> Result<bool> {
    let Some(settings) = settings_for(stage, hook_command) else {
        return Ok(false);
    };

    let path = settings_path(worktree);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(&settings)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), stage = %stage, "Wrote agent settings");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_worker_settings_shape() {
        let settings = settings_for(Stage::Worker, "fanout hook").unwrap();
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["hooks"]["PostToolUse"][0]["matcher"], "Bash");
        assert_eq!(
            json["hooks"]["PostToolUse"][0]["hooks"][0]["type"],
            "command"
        );
        assert_eq!(
            json["hooks"]["PostToolUse"][0]["hooks"][0]["command"],
            "fanout hook --stage worker"
        );
    }

    #[test]
    fn test_committer_has_no_settings() {
        assert!(settings_for(Stage::Committer, "fanout hook").is_none());
        let dir = tempdir().unwrap();
        assert!(!write_settings(dir.path(), Stage::Committer, "fanout hook").unwrap());
        assert!(!settings_path(dir.path()).exists());
    }

    #[test]
    fn test_reviewer_settings_replace_worker_settings() {
        let dir = tempdir().unwrap();
        assert!(write_settings(dir.path(), Stage::Worker, "fanout hook").unwrap());
        assert!(write_settings(dir.path(), Stage::Reviewer, "fanout hook").unwrap());

        let content = std::fs::read_to_string(settings_path(dir.path())).unwrap();
        let parsed: AgentSettings = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.hooks.post_tool_use.len(), 1);
        assert_eq!(
            parsed.hooks.post_tool_use[0].hooks[0].command,
            "fanout hook --stage reviewer"
        );
    }
}
