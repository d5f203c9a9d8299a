use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(version, about = "Fan one prompt out to isolated coding agents")]
pub struct Cli {
    /// Path to fanout.toml. Defaults to ./fanout.toml when present.
    #[arg(long, global = true, env = "FANOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Execution substrate: docker, memory
        #[arg(long)]
        backend: Option<String>,
    },
    /// Agent hook: read a tool event on stdin and signal stage completion.
    /// Always exits successfully so the agent is never interrupted.
    Hook {
        /// Stage to report instead of $AGENT_ROLE
        #[arg(long)]
        stage: Option<String>,
    },
    /// Reconcile active runs and reclaim expired jobs once, then exit
    Reap,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration and report problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve {
            host,
            port,
            backend,
        } => {
            cmd::cmd_serve(
                config_path,
                cmd::ServeOverrides {
                    host,
                    port,
                    backend,
                },
            )
            .await?;
        }
        Commands::Hook { stage } => {
            cmd::cmd_hook(stage.as_deref()).await;
        }
        Commands::Reap => {
            cmd::cmd_reap(config_path).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(config_path, command)?;
        }
    }

    Ok(())
}
