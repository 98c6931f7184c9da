//! Config command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};

use tally_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            output.json(&config)?;
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:          {}", config.data_dir.display());
            println!(
                "  log_file:          {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  write_queue_depth: {}", config.write_queue_depth);
            println!("  notify_capacity:   {}", config.notify_capacity);
            println!("  read_pool_size:    {}", config.read_pool_size);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let count = |name: &str| -> Result<usize> {
        let n: usize = value
            .parse()
            .with_context(|| format!("Invalid value for {}. Use a positive number.", name))?;
        if n == 0 {
            bail!("{} must be at least 1", name);
        }
        Ok(n)
    };

    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        "write_queue_depth" => config.write_queue_depth = count(key)?,
        "notify_capacity" => config.notify_capacity = count(key)?,
        "read_pool_size" => config.read_pool_size = count(key)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, log_file, write_queue_depth, notify_capacity, read_pool_size",
                key
            );
        }
    }
    Ok(())
}
