//! Tracing setup for the `foundry` binary.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub struct LogOptions<'a> {
    pub format: LogFormat,
    pub verbose: bool,
    /// Filter used when neither `FOUNDRY_LOG` nor `RUST_LOG` is set.
    pub default_level: &'a str,
    /// Directory for the daily-rolling file log; `None` disables it.
    pub log_dir: Option<&'a Path>,
}

/// Build the env filter: `FOUNDRY_LOG`, then `RUST_LOG`, then the default.
pub fn env_filter(default_level: &str, verbose: bool) -> EnvFilter {
    if let Ok(spec) = std::env::var("FOUNDRY_LOG")
        && let Ok(filter) = EnvFilter::try_new(&spec)
    {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { default_level };
    EnvFilter::try_new(format!("foundry={level},foundry_common={level},warn"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(options: LogOptions<'_>) -> Option<WorkerGuard> {
    let filter = env_filter(options.default_level, options.verbose);

    let mut guard = None;
    let file_layer = match options.log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "foundry.log");
                let (writer, g) = tracing_appender::non_blocking(appender);
                guard = Some(g);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(filter.clone()),
                )
            }
            Err(err) => {
                eprintln!("Warning: failed to create log directory {}: {}", dir.display(), err);
                None
            }
        },
        None => None,
    };

    // Console output goes to stderr so `--json` command output stays clean.
    let console_layer = match options.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init();

    guard
}
