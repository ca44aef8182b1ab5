//! Configuration for Foundry, read from `.foundry/foundry.toml`.
//!
//! Settings are layered, later layers winning:
//! 1. user-global file (`<config_dir>/foundry/foundry.toml`)
//! 2. project file (`.foundry/foundry.toml`)
//! 3. environment variables
//! 4. CLI flags
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! max_parallel = 4
//! max_review_retries = 3
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! multiplier = 2.0
//!
//! [agents]
//! command = "claude"
//! args = ["--print"]
//! timeout_secs = 600
//!
//! [agents.roles.reviewer]
//! command = "claude"
//! args = ["--print", "--model", "opus"]
//!
//! [publish]
//! mode = "git"
//! repo_path = "."
//! remote = "origin"
//! base_branch = "main"
//! open_pull_request = true
//!
//! [store]
//! backend = "sqlite"
//!
//! [retention]
//! max_age_days = 30
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const CONFIG_FILE: &str = "foundry.toml";
pub const FOUNDRY_DIR: &str = ".foundry";

/// `[pipeline]`: concurrency and review-loop bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Maximum file tasks developed at the same time within one build.
    pub max_parallel: usize,
    /// Rejections after which a file task fails.
    pub max_review_retries: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_review_retries: 3,
        }
    }
}

/// Per-role override of the agent command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleOverride {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// `[agents]`: how agent capabilities are reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Keyed by role name (`specifier`, `architect`, `coder`, `reviewer`).
    pub roles: HashMap<String, RoleOverride>,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            timeout_secs: 600,
            roles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Write approved files under `<output_dir>/<build_id>/`.
    #[default]
    Directory,
    /// Commit to a branch, push, and open a pull request.
    Git,
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishMode::Directory => write!(f, "directory"),
            PublishMode::Git => write!(f, "git"),
        }
    }
}

impl std::str::FromStr for PublishMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "directory" | "dir" => Ok(PublishMode::Directory),
            "git" => Ok(PublishMode::Git),
            _ => anyhow::bail!("Invalid publish mode '{}'. Valid values: directory, git", s),
        }
    }
}

/// `[publish]`: where approved file sets go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSection {
    pub mode: PublishMode,
    /// Directory mode output root; relative paths resolve against the project.
    pub output_dir: PathBuf,
    /// Git mode work tree; defaults to the project directory.
    pub repo_path: Option<PathBuf>,
    pub remote: String,
    pub base_branch: String,
    pub open_pull_request: bool,
    /// Falls back to `GITHUB_TOKEN`.
    pub github_token: Option<String>,
    /// Attempts for GitHub API calls (pushes are never retried).
    pub api_attempts: u32,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            mode: PublishMode::Directory,
            output_dir: PathBuf::from(FOUNDRY_DIR).join("out"),
            repo_path: None,
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            open_pull_request: true,
            github_token: None,
            api_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// `[store]`: build persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// SQLite database path; relative paths resolve against `.foundry/`.
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("builds.db"),
        }
    }
}

/// `[retention]`: cleanup of finished builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub max_age_days: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self { max_age_days: 30 }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when neither `FOUNDRY_LOG` nor `RUST_LOG` is set.
    pub level: String,
    /// Write a daily-rolling log under `.foundry/logs/`.
    pub file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

/// Root of `foundry.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryToml {
    pub pipeline: PipelineSection,
    pub retry: RetryPolicy,
    pub agents: AgentsSection,
    pub publish: PublishSection,
    pub store: StoreSection,
    pub retention: RetentionSection,
    pub logging: LoggingSection,
}

impl FoundryToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foundry.toml")
    }

    /// Load the project file from `foundry_dir`, layered over the user-global
    /// file when one exists. Missing files fall back to defaults.
    pub fn load_or_default(foundry_dir: &Path) -> Result<Self> {
        let layers = [global_config_path(), Some(foundry_dir.join(CONFIG_FILE))];
        let mut merged = toml::Table::new();
        for path in layers.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            merge_tables(&mut merged, table);
        }
        toml::Value::Table(merged)
            .try_into()
            .context("Failed to parse foundry.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foundry.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Return human-readable warnings for suspicious settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_parallel == 0 {
            warnings.push("pipeline.max_parallel is 0; at least one task must run".to_string());
        }
        if self.pipeline.max_review_retries == 0 {
            warnings.push(
                "pipeline.max_review_retries is 0; the first rejection will fail the build"
                    .to_string(),
            );
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; agents are still called once".to_string());
        }
        if self.retry.multiplier < 1.0 {
            warnings.push(format!(
                "retry.multiplier {} is below 1.0; delays will not grow",
                self.retry.multiplier
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            warnings.push("retry.initial_delay_ms exceeds retry.max_delay_ms".to_string());
        }
        if self.agents.timeout_secs == 0 {
            warnings.push("agents.timeout_secs is 0; every call will time out".to_string());
        }
        if self.agents.command.trim().is_empty() {
            warnings.push("agents.command is empty".to_string());
        }
        for role in self.agents.roles.keys() {
            if role.parse::<foundry_common::AgentRole>().is_err() {
                warnings.push(format!("Unknown agent role '{}' in [agents.roles]", role));
            }
        }
        if self.publish.mode == PublishMode::Git
            && let Some(token) = &self.publish.github_token
            && !crate::publish::github::is_valid_github_token(token)
        {
            warnings.push("publish.github_token does not look like a GitHub token".to_string());
        }
        if self.publish.base_branch.trim().is_empty() {
            warnings.push("publish.base_branch is empty".to_string());
        }

        warnings
    }
}

/// Path of the user-global config file, if the platform has a config dir.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("foundry").join(CONFIG_FILE))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Resolved configuration: file layers plus environment plus CLI flags.
#[derive(Debug, Clone)]
pub struct FoundryConfig {
    pub project_dir: PathBuf,
    pub foundry_dir: PathBuf,
    pub toml: FoundryToml,
    pub cli_max_parallel: Option<usize>,
    pub cli_max_review_retries: Option<u32>,
    pub cli_agent_cmd: Option<String>,
    pub cli_publish_mode: Option<PublishMode>,
}

impl FoundryConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foundry_dir = project_dir.join(FOUNDRY_DIR);
        let toml = FoundryToml::load_or_default(&foundry_dir)?;
        Ok(Self::from_parts(project_dir, toml))
    }

    pub fn from_parts(project_dir: PathBuf, toml: FoundryToml) -> Self {
        let foundry_dir = project_dir.join(FOUNDRY_DIR);
        Self {
            project_dir,
            foundry_dir,
            toml,
            cli_max_parallel: None,
            cli_max_review_retries: None,
            cli_agent_cmd: None,
            cli_publish_mode: None,
        }
    }

    /// CLI → `FOUNDRY_MAX_PARALLEL` → file.
    pub fn max_parallel(&self) -> usize {
        self.cli_max_parallel
            .or_else(|| env_parse("FOUNDRY_MAX_PARALLEL"))
            .unwrap_or(self.toml.pipeline.max_parallel)
            .max(1)
    }

    /// CLI → `FOUNDRY_MAX_REVIEW_RETRIES` → file.
    pub fn max_review_retries(&self) -> u32 {
        self.cli_max_review_retries
            .or_else(|| env_parse("FOUNDRY_MAX_REVIEW_RETRIES"))
            .unwrap_or(self.toml.pipeline.max_review_retries)
            .max(1)
    }

    /// CLI → `FOUNDRY_AGENT_CMD` → file.
    pub fn agent_command(&self) -> String {
        self.cli_agent_cmd
            .clone()
            .or_else(|| std::env::var("FOUNDRY_AGENT_CMD").ok())
            .unwrap_or_else(|| self.toml.agents.command.clone())
    }

    pub fn publish_mode(&self) -> PublishMode {
        self.cli_publish_mode.unwrap_or(self.toml.publish.mode)
    }

    /// File → `GITHUB_TOKEN`.
    pub fn github_token(&self) -> Option<String> {
        self.toml
            .publish
            .github_token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.toml.retry.clone()
    }

    pub fn config_file(&self) -> PathBuf {
        self.foundry_dir.join(CONFIG_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        self.foundry_dir.join(&self.toml.store.path)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.foundry_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.foundry_dir.join("logs")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.publish.output_dir)
    }

    pub fn repo_path(&self) -> PathBuf {
        match &self.toml.publish.repo_path {
            Some(path) => self.project_dir.join(path),
            None => self.project_dir.clone(),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if self.publish_mode() == PublishMode::Git
            && self.toml.publish.open_pull_request
            && self.github_token().is_none()
        {
            warnings.push(
                "publish.mode is git with pull requests enabled but no GitHub token is set"
                    .to_string(),
            );
        }
        warnings
    }
}
