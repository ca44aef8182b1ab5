//! Typed error hierarchy for the Foundry orchestrator.
//!
//! - `AgentError` covers agent calls (transport, timeout, malformed output)
//! - `PlanError` covers File Plan validation
//! - `StoreError` covers build persistence
//! - `PublishError` covers the publisher adapters
//! - `PipelineError` is what the build service hands back to its callers
//!
//! Domain failures (an agent that never answers, a reviewer that always
//! rejects) do not surface here; they end up on the build's error record.
//! Only infrastructure failures propagate as `Err`.

use std::time::Duration;

use foundry_common::{AgentRole, BuildId, BuildStatus, InvalidTransition};
use thiserror::Error;

/// Errors from one agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Agent exited with non-zero code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Malformed {role} response: {message}")]
    Malformed { role: AgentRole, message: String },

    #[error("Agent transport error: {0}")]
    Transport(String),
}

impl AgentError {
    pub fn malformed(role: AgentRole, message: impl Into<String>) -> Self {
        Self::Malformed {
            role,
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// A missing executable will be missing on the next attempt too; every
    /// other failure, including unparseable output, is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => source.kind() != std::io::ErrorKind::NotFound,
            _ => true,
        }
    }
}

/// File Plan validation failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("File plan is empty")]
    Empty,

    #[error("Duplicate file path in plan: {0}")]
    DuplicatePath(String),

    #[error("File '{path}' depends on unknown file '{dependency}'")]
    UnknownDependency { path: String, dependency: String },

    #[error("Cycle detected in file dependencies. Involved files: {0:?}")]
    Cycle(Vec<String>),

    #[error("Unsafe file path '{path}': {reason}")]
    UnsafePath { path: String, reason: String },
}

/// Errors from the build state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Build {0} not found")]
    NotFound(BuildId),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Corrupt build record {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize build {id}: {source}")]
    Serialize {
        id: BuildId,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Database errors (a busy or briefly unavailable file) may clear up;
    /// missing, corrupt or unserializable records will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Publisher failures. Recorded on the build as a VCS error.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsafe output path: {0}")]
    UnsafePath(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("git push failed for branch {branch}: {stderr}")]
    Push { branch: String, stderr: String },

    #[error("GitHub authentication failed: {0}")]
    Auth(String),

    #[error("GitHub API error ({status}): {message}")]
    GitHub { status: u16, message: String },

    #[error("Cannot determine GitHub repository from remote '{0}'")]
    InvalidRemote(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PublishError {
    /// Transient failures of steps that are safe to repeat.
    ///
    /// Pushes are never classified as retryable: a push that failed after the
    /// remote accepted it would be ambiguous.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GitHub { status, .. } if *status >= 500 || *status == 429)
    }
}

impl From<git2::Error> for PublishError {
    fn from(err: git2::Error) -> Self {
        Self::Git(err.message().to_string())
    }
}

/// Errors surfaced by the build service and the stage sequencer.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Build {0} is already being driven")]
    AlreadyRunning(BuildId),

    #[error("Build {id} is {status} and cannot be resumed")]
    NotResumable { id: BuildId, status: BuildStatus },

    #[error("Build {id} is {status}; only finished builds can be deleted")]
    NotFinished { id: BuildId, status: BuildStatus },

    #[error("Build {id} is locked by another process")]
    Locked { id: BuildId },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
