//! Configuration view and validation commands (`conductor config`).

use anyhow::Result;
use std::path::Path;

use conductor::config::{ConductorToml, CONFIG_DIR};

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    effective: &ConductorToml,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = ConductorToml::path_in(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let rt = &effective.runtime;
            println!("[runtime]");
            println!("  base_url = \"{}\"", rt.base_url);
            println!("  timeout_secs = {}", rt.timeout_secs);
            println!("  poll_interval_secs = {}", rt.poll_interval_secs);
            println!("  stable_polls = {}", rt.stable_polls);
            println!("  conversation_prefix = \"{}\"", rt.conversation_prefix);
            println!("  request_timeout_secs = {}", rt.request_timeout_secs);
            println!("  clear_before_execute = {}", rt.clear_before_execute);
            println!("  error_markers = {:?}", rt.error_markers);
            println!();

            println!("[topics]");
            println!("  gap_secs = {}", effective.topics.gap_secs);
            println!("  history_limit = {}", effective.topics.history_limit);
            println!();

            println!("[gates]");
            match effective.gates.expire_after_hours {
                Some(hours) => println!("  expire_after_hours = {}", hours),
                None => println!("  expire_after_hours = (disabled)"),
            }
            println!();

            println!("[database]");
            println!(
                "  path = \"{}\"",
                effective.database_path(project_dir).display()
            );
            println!();

            println!("[logging]");
            println!("  level = \"{}\"", effective.logging.level);
            println!(
                "  format = \"{}\"",
                match effective.logging.format {
                    conductor::config::LogFormat::Pretty => "pretty",
                    conductor::config::LogFormat::Json => "json",
                }
            );
            println!();

            if !config_path.exists() {
                println!("Run 'conductor config init' to create a conductor.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            write_default_config(project_dir)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [runtime] base_url, timeout_secs, poll_interval_secs, stable_polls");
            println!("  - [topics] gap_secs, history_limit");
            println!("  - [gates] expire_after_hours");
            println!();
        }
    }

    Ok(())
}

/// Write a default conductor.toml, creating the config directory as needed.
/// Returns false when a file already exists.
pub(crate) fn write_default_config(project_dir: &Path) -> Result<bool> {
    let config_path = ConductorToml::path_in(project_dir);
    if config_path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(project_dir.join(CONFIG_DIR))?;
    ConductorToml::default().save(&config_path)?;
    Ok(true)
}
