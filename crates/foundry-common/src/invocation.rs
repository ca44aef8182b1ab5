use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four agent capabilities the pipeline calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Specifier,
    Architect,
    Coder,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Specifier => "specifier",
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
        }
    }

    pub fn all() -> [AgentRole; 4] {
        [Self::Specifier, Self::Architect, Self::Coder, Self::Reviewer]
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specifier" => Ok(Self::Specifier),
            "architect" => Ok(Self::Architect),
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Append-only audit entry for one agent call attempt.
///
/// Observability data only; the orchestrator never branches on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub role: AgentRole,
    /// File path for Coder/Reviewer calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// 1-based transport attempt within one backoff sequence.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub summary: String,
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
}

impl InvocationRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Succeeded)
    }
}
