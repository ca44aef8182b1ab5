//! Configuration view and validation commands: `foundry config`.

use anyhow::{Context, Result};
use foundry::config::{FoundryConfig, FoundryToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &FoundryConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foundry Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foundry.toml found at {}", config_path.display());
                println!("Run 'foundry config init' to create one.");
            }
            println!();

            let file = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", file.trim_end());
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  max_parallel = {}", config.max_parallel());
            println!("  max_review_retries = {}", config.max_review_retries());
            println!("  agent_command = \"{}\"", config.agent_command());
            println!("  publish_mode = \"{}\"", config.publish_mode());
            println!(
                "  github_token = {}",
                if config.github_token().is_some() { "set" } else { "unset" }
            );
            println!("  store = {}", config.store_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
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
                println!("foundry.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.foundry_dir).with_context(|| {
                format!("Failed to create {}", config.foundry_dir.display())
            })?;
            FoundryToml::default().save(&config_path)?;

            println!("Created foundry.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] max_parallel, max_review_retries");
            println!("  - [agents] command, args, timeout_secs, per-role overrides");
            println!("  - [publish] mode, base_branch, open_pull_request");
            println!();
        }
    }

    Ok(())
}
