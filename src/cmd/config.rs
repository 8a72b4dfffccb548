//! Configuration view and validation commands: `stepwright config`.

use anyhow::Result;
use std::path::Path;

use stepwright::config::StepwrightConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => StepwrightConfig::default_path(project_dir),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Stepwright Configuration").bold().cyan());
            println!("========================");
            println!();

            let mut config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                StepwrightConfig::load(&config_path)?
            } else {
                println!("No stepwright.toml found at {}", config_path.display());
                println!("Using default configuration.");
                StepwrightConfig::default()
            };
            println!();
            config.apply_env_overrides();

            println!("[server]");
            println!("  host = \"{}\"", config.server.host);
            println!("  port = {}", config.server.port);
            println!("  db_path = \"{}\"", config.server.db_path.display());
            println!("  dev_mode = {}", config.server.dev_mode);
            println!();

            println!("[engine]");
            println!("  base_url = \"{}\"", config.engine.base_url);
            println!("  open_timeout_secs = {}", config.engine.open_timeout_secs);
            println!("  command_timeout_secs = {}", config.engine.command_timeout_secs);
            println!("  login_timeout_secs = {}", config.engine.login_timeout_secs);
            println!("  callback_key = {}", redacted(config.engine.callback_key.as_deref()));
            println!();

            println!("[session]");
            println!("  ttl_minutes = {}", config.session.ttl_minutes);
            println!("  sweep_interval_secs = {}", config.session.sweep_interval_secs);
            println!();

            println!("[sealing]");
            println!("  key = {}", redacted(config.sealing.key.as_deref()));
            println!();

            println!("[logging]");
            println!("  json = {}", config.logging.json);
            match &config.logging.dir {
                Some(dir) => println!("  dir = \"{}\"", dir.display()),
                None => println!("  dir = (console only)"),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut config = if config_path.exists() {
                StepwrightConfig::load(&config_path)?
            } else {
                println!("No stepwright.toml found. Checking defaults.");
                StepwrightConfig::default()
            };
            config.apply_env_overrides();
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stepwright.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            StepwrightConfig::default().save(&config_path)?;

            println!("Created stepwright.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] base_url, timeouts, callback_key");
            println!("  - [sealing] key (base64, 32 bytes)");
            println!("  - [session] ttl_minutes, sweep_interval_secs");
            println!();
        }
    }

    Ok(())
}

fn redacted(value: Option<&str>) -> &'static str {
    match value {
        Some(_) => "(set)",
        None => "(not set)",
    }
}
