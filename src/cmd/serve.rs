//! Orchestrator server and one-shot maintenance commands, `fanout serve` and `fanout reap`.

use std::path::Path;

use anyhow::Result;
use fanout::config::FanoutConfig;
use fanout::{logging, server, substrate};
use tracing::info;

/// CLI flags that win over file and environment configuration.
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<String>,
}

pub async fn cmd_serve(config_path: Option<&Path>, overrides: ServeOverrides) -> Result<()> {
    let mut config = FanoutConfig::resolve(config_path)?;
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(backend) = overrides.backend {
        config.jobs.backend = backend.parse()?;
    }

    let _guard = logging::init(&config.logging)?;
    server::start_server(config).await
}

pub async fn cmd_reap(config_path: Option<&Path>) -> Result<()> {
    let config = FanoutConfig::resolve(config_path)?;
    let _guard = logging::init(&config.logging)?;

    let coordinator = server::build_coordinator(&config, substrate::from_config(&config)?)?;
    server::maintenance_pass(&coordinator).await;
    info!("Maintenance pass complete");
    Ok(())
}
