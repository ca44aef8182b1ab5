use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foundry::config::{FoundryConfig, PublishMode};
use foundry::logging::{self, LogFormat, LogOptions};
use foundry_common::BuildStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "foundry")]
#[command(version, about = "Turn a natural-language request into a reviewed, published change set")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Maximum file tasks developed at the same time. Overrides foundry.toml.
    #[arg(long, global = true)]
    pub max_parallel: Option<usize>,

    /// Rejections after which a file task fails. Overrides foundry.toml.
    #[arg(long, global = true)]
    pub max_review_retries: Option<u32>,

    /// Agent command for every role. Overrides foundry.toml and FOUNDRY_AGENT_CMD.
    #[arg(long, global = true)]
    pub agent_cmd: Option<String>,

    /// Where approved files go: directory or git
    #[arg(long, global = true)]
    pub publish_mode: Option<PublishMode>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .foundry directory and a default foundry.toml
    Init,
    /// Submit a request and drive it to completion in the foreground
    Run {
        request: String,
        /// Print the final status report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a request as a pending build without driving it
    Submit {
        request: String,
        #[arg(long)]
        json: bool,
    },
    /// Show one build's status, plan and outcome
    Status {
        /// Build id or a unique prefix of it
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List builds, newest first
    List {
        #[arg(long)]
        status: Option<BuildStatus>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Ask a build to stop at its next boundary
    Cancel { id: String },
    /// Continue a pending or interrupted build in the foreground
    Resume {
        id: String,
        /// Re-attempt only the publish step of a build that failed publishing
        #[arg(long)]
        republish: bool,
        #[arg(long)]
        json: bool,
    },
    /// Delete one finished build
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Delete finished builds older than the retention window
    Cleanup {
        /// Defaults to [retention] max_age_days
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// View, validate or create foundry.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default foundry.toml
    Init,
}

fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<FoundryConfig> {
    let mut config = FoundryConfig::new(project_dir)?;
    config.cli_max_parallel = cli.max_parallel;
    config.cli_max_review_retries = cli.max_review_retries;
    config.cli_agent_cmd = cli.agent_cmd.clone();
    config.cli_publish_mode = cli.publish_mode;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _ = dotenvy::from_path(project_dir.join(".env"));

    let config = load_config(&cli, project_dir)?;

    // File logging only once the project has been initialized.
    let log_dir = config.log_dir();
    let _log_guard = logging::init(LogOptions {
        format: cli.log_format,
        verbose: cli.verbose,
        default_level: &config.toml.logging.level,
        log_dir: (config.toml.logging.file && config.foundry_dir.exists())
            .then_some(log_dir.as_path()),
    });

    let code = match &cli.command {
        Commands::Init => {
            cmd::cmd_init(&config)?;
            ExitCode::SUCCESS
        }
        Commands::Config { command } => {
            cmd::cmd_config(&config, command.clone())?;
            ExitCode::SUCCESS
        }
        Commands::Run { request, json } => {
            let status = cmd::cmd_run(&config, request, *json, cli.verbose).await?;
            exit_code(status)
        }
        Commands::Submit { request, json } => {
            cmd::cmd_submit(&config, request, *json).await?;
            ExitCode::SUCCESS
        }
        Commands::Resume {
            id,
            republish,
            json,
        } => {
            let status = cmd::cmd_resume(&config, id, *republish, *json, cli.verbose).await?;
            exit_code(status)
        }
        Commands::Status { id, json } => {
            cmd::cmd_status(&config, id, *json).await?;
            ExitCode::SUCCESS
        }
        Commands::List {
            status,
            limit,
            json,
        } => {
            cmd::cmd_list(&config, *status, *limit, *json).await?;
            ExitCode::SUCCESS
        }
        Commands::Cancel { id } => {
            cmd::cmd_cancel(&config, id).await?;
            ExitCode::SUCCESS
        }
        Commands::Delete { id, yes } => {
            cmd::cmd_delete(&config, id, *yes).await?;
            ExitCode::SUCCESS
        }
        Commands::Cleanup {
            older_than_days,
            yes,
        } => {
            cmd::cmd_cleanup(&config, *older_than_days, *yes).await?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}

fn exit_code(status: BuildStatus) -> ExitCode {
    match status {
        BuildStatus::Completed => ExitCode::SUCCESS,
        BuildStatus::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}
