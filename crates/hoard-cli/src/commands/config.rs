//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use hoard_core::Config;

use crate::output::{format_bytes, Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, database_name, quota_bytes, batch_size, \
    health_check_interval_secs, healthy_below_percent, refuse_writes_above_percent, \
    blob_chunk_size, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
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
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:                    {}", config.data_dir.display());
            println!("  database_name:               {}", config.database_name);
            println!(
                "  quota_bytes:                 {} ({})",
                config.quota_bytes,
                format_bytes(config.quota_bytes)
            );
            println!("  batch_size:                  {}", config.batch_size);
            println!(
                "  health_check_interval_secs:  {}",
                config.health_check_interval_secs
            );
            println!(
                "  healthy_below_percent:       {}",
                config.healthy_below_percent
            );
            println!(
                "  refuse_writes_above_percent: {}",
                config.refuse_writes_above_percent
            );
            println!("  blob_chunk_size:             {}", config.blob_chunk_size);
            println!(
                "  log_file:                    {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "database_name" => {
            if value.is_empty() {
                bail!("database_name cannot be empty");
            }
            config.database_name = value.to_string();
        }
        "quota_bytes" => {
            config.quota_bytes = value
                .parse()
                .context("Invalid value for quota_bytes. Use a byte count (0 = unlimited).")?;
        }
        "batch_size" => {
            let size: usize = value
                .parse()
                .context("Invalid value for batch_size. Use a positive integer.")?;
            config.batch_size = size.max(1);
        }
        "health_check_interval_secs" => {
            config.health_check_interval_secs = value
                .parse()
                .context("Invalid value for health_check_interval_secs. Use seconds (0 = off).")?;
        }
        "healthy_below_percent" => {
            config.healthy_below_percent = parse_percent(key, value)?;
        }
        "refuse_writes_above_percent" => {
            config.refuse_writes_above_percent = parse_percent(key, value)?;
        }
        "blob_chunk_size" => {
            let size: usize = value
                .parse()
                .context("Invalid value for blob_chunk_size. Use a byte count.")?;
            config.blob_chunk_size = size.max(1);
        }
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn parse_percent(key: &str, value: &str) -> Result<f64> {
    let percent: f64 = value
        .parse()
        .with_context(|| format!("Invalid value for {}. Use a number from 0 to 100.", key))?;
    if !(0.0..=100.0).contains(&percent) {
        bail!("{} must be between 0 and 100", key);
    }
    Ok(percent)
}
