//! Configuration view and validation commands, `fanout config`.

use std::path::Path;

use anyhow::Result;
use fanout::config::FanoutConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    // resolve() validates; an invalid file fails here with every problem listed.
    let config = FanoutConfig::resolve(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            println!("Configuration is valid.");
            println!("  backend:     {:?}", config.jobs.backend);
            println!("  image:       {}", config.jobs.image);
            println!("  output base: {}", config.storage.output_base.display());
            println!("  state db:    {}", config.storage.db_path().display());
            println!("  max agents:  {}", config.runs.max_agents);
        }
    }
    Ok(())
}
