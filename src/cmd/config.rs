//! Configuration view and init commands.

use anyhow::{Context, Result};
use std::path::Path;

use serialforge::config::EngineConfig;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = EngineConfig::config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No engine.toml found at {}", config_path.display());
                println!("Run 'serialforge config init' to create one.");
            }
            println!();

            let config = EngineConfig::load(project_dir)?;
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("engine.toml already exists at {}", config_path.display());
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            let content = EngineConfig::default().to_toml()?;
            std::fs::write(&config_path, content)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
