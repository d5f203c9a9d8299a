//! Layered configuration for the orchestrator.
//!
//! Values resolve in order: built-in defaults → `fanout.toml` → `FANOUT_*`
//! environment variables → CLI flags (applied by the binary).
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [storage]
//! output_base = "/mnt/claude-output"
//!
//! [runs]
//! max_agents = 10
//! stage_timeout_secs = 3600
//!
//! [jobs]
//! backend = "docker"
//! image = "mcp-worker:latest"
//! ttl_seconds_after_finished = 3600
//!
//! [jobs.resources]
//! cpu_request = "1"
//! memory_request = "1Gi"
//! cpu_limit = "2"
//! memory_limit = "2Gi"
//!
//! [trigger]
//! callback_url = "http://orchestrator:8080"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file looked up in the working directory.
pub const CONFIG_FILE: &str = "fanout.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanoutConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub runs: RunsSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub trigger: TriggerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allow any origin (the front door runs on a different host).
    #[serde(default = "default_true")]
    pub cors_permissive: bool,
    /// Interval of the background reconcile + retention sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_permissive: true,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Shared volume holding every run directory.
    #[serde(default = "default_output_base")]
    pub output_base: PathBuf,
    /// SQLite state file. Defaults to `<output_base>/.fanout/state.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

fn default_output_base() -> PathBuf {
    PathBuf::from("/mnt/claude-output")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            output_base: default_output_base(),
            db_path: None,
        }
    }
}

impl StorageSection {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.output_base.join(".fanout").join("state.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsSection {
    #[serde(default = "default_max_agents")]
    pub max_agents: u32,
    /// Wall-clock budget for a single stage before the lane is failed.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

fn default_max_agents() -> u32 {
    10
}

fn default_stage_timeout() -> u64 {
    3600
}

/// Upper bound for `runs.stage_timeout_secs` (30 days).
pub const MAX_STAGE_TIMEOUT_SECS: u64 = 30 * 24 * 3600;

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

/// Which execution substrate runs the jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    /// In-process substrate; jobs never run. Useful for dry runs.
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "memory" => Ok(Self::Memory),
            _ => anyhow::bail!("Invalid backend '{}'. Valid values: docker, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_image")]
    pub image: String,
    /// Value of the `app` label on every job.
    #[serde(default = "default_app_label")]
    pub app_label: String,
    /// How long finished job bookkeeping is retained before it may be reclaimed.
    #[serde(default = "default_ttl")]
    pub ttl_seconds_after_finished: u64,
    #[serde(default = "default_run_as_user")]
    pub run_as_user: u32,
    /// Host path of the shared volume. Defaults to `storage.output_base`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_host_path: Option<PathBuf>,
    /// Orchestrator environment variables forwarded into every job.
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default)]
    pub resources: ResourceEnvelope,
}

fn default_image() -> String {
    "mcp-worker:latest".to_string()
}

fn default_app_label() -> String {
    "mcp-worker".to_string()
}

fn default_ttl() -> u64 {
    3600
}

fn default_run_as_user() -> u32 {
    1000
}

fn default_passthrough_env() -> Vec<String> {
    vec![
        "ANTHROPIC_API_KEY".to_string(),
        "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
    ]
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            image: default_image(),
            app_label: default_app_label(),
            ttl_seconds_after_finished: default_ttl(),
            run_as_user: default_run_as_user(),
            volume_host_path: None,
            passthrough_env: default_passthrough_env(),
            network: None,
            resources: ResourceEnvelope::default(),
        }
    }
}

/// CPU/memory requests and limits, written in cluster quantity notation
/// (`"500m"`, `"2"`, `"512Mi"`, `"2Gi"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,
    #[serde(default = "default_memory_request")]
    pub memory_request: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
}

fn default_cpu_request() -> String {
    "1".to_string()
}

fn default_memory_request() -> String {
    "1Gi".to_string()
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_memory_limit() -> String {
    "2Gi".to_string()
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            cpu_request: default_cpu_request(),
            memory_request: default_memory_request(),
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
        }
    }
}

impl ResourceEnvelope {
    pub fn cpu_request_nanos(&self) -> Result<i64> {
        parse_cpu_nanos(&self.cpu_request)
    }

    pub fn cpu_limit_nanos(&self) -> Result<i64> {
        parse_cpu_nanos(&self.cpu_limit)
    }

    pub fn memory_request_bytes(&self) -> Result<i64> {
        parse_memory_bytes(&self.memory_request)
    }

    pub fn memory_limit_bytes(&self) -> Result<i64> {
        parse_memory_bytes(&self.memory_limit)
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let cpu = (self.cpu_request_nanos(), self.cpu_limit_nanos());
        let mem = (self.memory_request_bytes(), self.memory_limit_bytes());
        for result in [&cpu.0, &cpu.1, &mem.0, &mem.1] {
            if let Err(e) = result {
                problems.push(e.to_string());
            }
        }
        if let (Ok(req), Ok(lim)) = cpu
            && req > lim
        {
            problems.push(format!(
                "cpu_request '{}' exceeds cpu_limit '{}'",
                self.cpu_request, self.cpu_limit
            ));
        }
        if let (Ok(req), Ok(lim)) = mem
            && req > lim
        {
            problems.push(format!(
                "memory_request '{}' exceeds memory_limit '{}'",
                self.memory_request, self.memory_limit
            ));
        }
        problems
    }
}

/// Parse a CPU quantity (`"2"`, `"1.5"`, `"500m"`) into nano-CPUs.
pub fn parse_cpu_nanos(quantity: &str) -> Result<i64> {
    let q = quantity.trim();
    let cpus = if let Some(milli) = q.strip_suffix('m') {
        milli
            .parse::<f64>()
            .with_context(|| format!("Invalid cpu quantity '{}'", quantity))?
            / 1000.0
    } else {
        q.parse::<f64>()
            .with_context(|| format!("Invalid cpu quantity '{}'", quantity))?
    };
    if cpus <= 0.0 {
        anyhow::bail!("Invalid cpu quantity '{}': must be positive", quantity);
    }
    Ok((cpus * 1_000_000_000.0).round() as i64)
}

/// Parse a memory quantity (`"512Mi"`, `"2Gi"`, `"1G"`, `"1048576"`) into bytes.
pub fn parse_memory_bytes(quantity: &str) -> Result<i64> {
    const UNITS: &[(&str, i64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let q = quantity.trim();
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| q.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((q, 1));
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid memory quantity '{}'", quantity))?;
    if value <= 0.0 {
        anyhow::bail!("Invalid memory quantity '{}': must be positive", quantity);
    }
    Ok((value * multiplier as f64).round() as i64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSection {
    /// Base URL at which jobs reach the orchestrator's `/trigger` endpoint.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
    /// Command the agent runtime runs for role hooks.
    #[serde(default = "default_hook_command")]
    pub hook_command: String,
}

fn default_callback_url() -> String {
    "http://orchestrator:8080".to_string()
}

fn default_hook_command() -> String {
    "fanout hook".to_string()
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            callback_url: default_callback_url(),
            hook_command: default_hook_command(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily rolling log file here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

impl FanoutConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fanout.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Resolve the effective configuration: an explicit file must exist, otherwise
    /// `./fanout.toml` is used when present. Environment overrides are applied
    /// and the result validated.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::load(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;

        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }
        Ok(config)
    }

    /// Apply `FANOUT_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FANOUT_OUTPUT_BASE") {
            self.storage.output_base = PathBuf::from(v);
        }
        if let Some(v) = lookup("FANOUT_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FANOUT_WORKER_IMAGE").or_else(|| lookup("MCP_WORKER_IMAGE")) {
            self.jobs.image = v;
        }
        if let Some(v) = lookup("FANOUT_BACKEND") {
            self.jobs.backend = v.parse()?;
        }
        if let Some(v) = lookup("FANOUT_CALLBACK_URL") {
            self.trigger.callback_url = v;
        }
        if let Some(v) = lookup("FANOUT_MAX_AGENTS") {
            self.runs.max_agents = v
                .parse()
                .with_context(|| format!("Invalid FANOUT_MAX_AGENTS '{}'", v))?;
        }
        if let Some(v) = lookup("FANOUT_STAGE_TIMEOUT_SECS") {
            self.runs.stage_timeout_secs = v
                .parse()
                .with_context(|| format!("Invalid FANOUT_STAGE_TIMEOUT_SECS '{}'", v))?;
        }
        if let Some(v) = lookup("FANOUT_LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    /// Return every problem with the configuration; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.runs.max_agents == 0 {
            problems.push("runs.max_agents must be at least 1".to_string());
        }
        if self.runs.stage_timeout_secs == 0 {
            problems.push("runs.stage_timeout_secs must be positive".to_string());
        } else if self.runs.stage_timeout_secs > MAX_STAGE_TIMEOUT_SECS {
            problems.push(format!(
                "runs.stage_timeout_secs must be at most {} (30 days)",
                MAX_STAGE_TIMEOUT_SECS
            ));
        }
        if self.server.sweep_interval_secs == 0 {
            problems.push("server.sweep_interval_secs must be positive".to_string());
        }
        if self.jobs.image.trim().is_empty() {
            problems.push("jobs.image must not be empty".to_string());
        }
        if !self.trigger.callback_url.starts_with("http://")
            && !self.trigger.callback_url.starts_with("https://")
        {
            problems.push(format!(
                "trigger.callback_url '{}' must be an http(s) URL",
                self.trigger.callback_url
            ));
        }
        problems.extend(self.jobs.resources.problems());
        problems
    }

    /// Host path of the shared volume mounted into every job.
    pub fn volume_host_path(&self) -> PathBuf {
        self.jobs
            .volume_host_path
            .clone()
            .unwrap_or_else(|| self.storage.output_base.clone())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
