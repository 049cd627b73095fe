//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use tabstore_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let api_key = config.api_key.as_deref().map(mask_secret);

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "base_url": config.base_url,
                    "dataset_id": config.dataset_id,
                    "api_key": api_key,
                    "max_pages": config.max_pages,
                    "timeout_secs": config.timeout_secs
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.base_url);
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  base_url:     {}", config.base_url);
            println!(
                "  dataset_id:   {}",
                config.dataset_id.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  api_key:      {}",
                api_key.as_deref().unwrap_or("(not set)")
            );
            println!("  max_pages:    {}", config.max_pages);
            println!("  timeout_secs: {}", config.timeout_secs);
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

    match key.as_str() {
        "base_url" => {
            if value.is_empty() {
                bail!("base_url cannot be empty");
            }
            config.base_url = value.clone();
        }
        "dataset_id" => {
            config.dataset_id = optional(&value);
        }
        "api_key" => {
            config.api_key = optional(&value);
        }
        "max_pages" => {
            config.max_pages = value
                .parse()
                .context("Invalid value for max_pages. Use a positive integer.")?;
        }
        "timeout_secs" => {
            config.timeout_secs = value
                .parse()
                .context("Invalid value for timeout_secs. Use a number of seconds.")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: base_url, dataset_id, api_key, max_pages, timeout_secs",
                key
            );
        }
    }

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "api_key" {
        mask_secret(&value)
    } else {
        value
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

/// "" and "none" clear an optional value
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Keep `env:` references readable, hide literal keys
fn mask_secret(value: &str) -> String {
    if value.starts_with("env:") {
        value.to_string()
    } else {
        "********".to_string()
    }
}
