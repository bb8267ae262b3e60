//! Config command handlers

use std::path::Path;

use anyhow::{Context, Result};

use diffsync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: &Path, output: &Output) -> Result<()> {
    let config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "bind_addr": config.bind_addr,
                    "server_url": config.server_url,
                    "evict_empty_rooms": config.evict_empty_rooms,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:          {}", config.data_dir.display());
            println!("  bind_addr:         {}", config.bind_addr);
            println!(
                "  server_url:        {}",
                config.server_url.as_deref().unwrap_or("(not set)")
            );
            println!("  evict_empty_rooms: {}", config.evict_empty_rooms);
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    // "none" clears optional values, as an empty string does
    let value = if key == "server_url" && value == "none" {
        ""
    } else {
        value
    };
    config.set(key, value)?;

    config
        .save_to_path(config_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}
