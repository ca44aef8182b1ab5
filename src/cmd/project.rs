//! Project initialization: `foundry init`.

use anyhow::{Context, Result};
use foundry::config::{FoundryConfig, FoundryToml};

pub fn cmd_init(config: &FoundryConfig) -> Result<()> {
    let foundry_dir = &config.foundry_dir;
    let was_initialized = foundry_dir.exists();

    for dir in [foundry_dir.clone(), config.lock_dir(), config.log_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let config_path = config.config_file();
    let wrote_config = !config_path.exists();
    if wrote_config {
        FoundryToml::default().save(&config_path)?;
    }

    if was_initialized && !wrote_config {
        println!("Foundry project already initialized at {}", foundry_dir.display());
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized foundry project at {}", foundry_dir.display());
    println!();
    println!("Created directory structure:");
    println!("  .foundry/");
    println!("  ├── foundry.toml  # Pipeline, agent and publish settings");
    println!("  ├── locks/        # One lock file per build being driven");
    println!("  └── logs/         # Daily-rolling log files");
    println!();
    println!("Next steps:");
    println!("  1. Set [agents] command in .foundry/foundry.toml");
    println!("  2. Run `foundry run \"<request>\"` to start a build");
    Ok(())
}
