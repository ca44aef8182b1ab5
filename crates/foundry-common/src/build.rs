//! The Build record and its stage-transition rules.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::invocation::InvocationRecord;
use crate::plan::{FilePlan, FileStatus};

/// Opaque build identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex characters, used in branch names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BuildId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| format!("Invalid build id: {}", s))
    }
}

/// Pipeline stages, in their total order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Specification,
    Architecture,
    Development,
    Review,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Specification => "specification",
            Self::Architecture => "architecture",
            Self::Development => "development",
            Self::Review => "review",
            Self::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specification" => Ok(Self::Specification),
            "architecture" => Ok(Self::Architecture),
            "development" => Ok(Self::Development),
            "review" => Ok(Self::Review),
            "publish" => Ok(Self::Publish),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Pending,
    Specifying,
    Architecting,
    Developing,
    Reviewing,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Specifying => "specifying",
            Self::Architecting => "architecting",
            Self::Developing => "developing",
            Self::Reviewing => "reviewing",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stage a non-terminal status belongs to. Terminal statuses keep
    /// whatever stage the build ended in, so they map to `None`.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Pending | Self::Specifying => Some(Stage::Specification),
            Self::Architecting => Some(Stage::Architecture),
            Self::Developing => Some(Stage::Development),
            Self::Reviewing => Some(Stage::Review),
            Self::Publishing => Some(Stage::Publish),
            Self::Completed | Self::Failed | Self::Cancelled => None,
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// The only backward move is the Reviewing -> Developing oscillation of the
    /// development loop. Leaving a terminal status goes through
    /// [`Build::reopen_for_publish`] instead.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed | Cancelled)
                | (Pending, Specifying)
                | (Specifying, Architecting)
                | (Architecting, Developing)
                | (Developing, Reviewing)
                | (Reviewing, Developing)
                | (Developing | Reviewing, Publishing)
                | (Publishing, Completed)
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "specifying" => Ok(Self::Specifying),
            "architecting" => Ok(Self::Architecting),
            "developing" => Ok(Self::Developing),
            "reviewing" => Ok(Self::Reviewing),
            "publishing" => Ok(Self::Publishing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid build transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: BuildStatus,
    pub to: BuildStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

/// Output of the Specifier. Written once per build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub summary: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub stack: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AgentInvocation,
    PlanValidation,
    RetryExhausted,
    Vcs,
    StateStore,
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentInvocation => "agent_invocation",
            Self::PlanValidation => "plan_validation",
            Self::RetryExhausted => "retry_exhausted",
            Self::Vcs => "vcs",
            Self::StateStore => "state_store",
            Self::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_invocation" => Ok(Self::AgentInvocation),
            "plan_validation" => Ok(Self::PlanValidation),
            "retry_exhausted" => Ok(Self::RetryExhausted),
            "vcs" => Ok(Self::Vcs),
            "state_store" => Ok(Self::StateStore),
            "invariant_violation" => Ok(Self::InvariantViolation),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    pub reason: String,
}

/// Why a build failed. Surfaced verbatim through status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FailedFile>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedFile {
    pub path: String,
    /// Hex SHA-256 of the published content.
    pub digest: String,
}

/// Change-set reference returned by a publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationResult {
    /// Human-facing reference: PR URL, branch name, or output directory.
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub files: Vec<PublishedFile>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub request: String,
    pub status: BuildStatus,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stage_times: Vec<StageTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specification: Option<Specification>,
    #[serde(default)]
    pub plan: FilePlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication: Option<PublicationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub invocations: Vec<InvocationRecord>,
}

impl Build {
    pub fn new(request: &str) -> Self {
        let now = Utc::now();
        Self {
            id: BuildId::new(),
            request: request.to_string(),
            status: BuildStatus::Pending,
            stage: Stage::Specification,
            created_at: now,
            updated_at: now,
            finished_at: None,
            stage_times: vec![StageTiming {
                stage: Stage::Specification,
                entered_at: now,
                exited_at: None,
            }],
            specification: None,
            plan: FilePlan::default(),
            publication: None,
            error: None,
            invocations: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, updating the stage and its timing windows.
    pub fn transition(&mut self, next: BuildStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;

        match next.stage() {
            Some(stage) if stage != self.stage => {
                self.close_stage(now);
                self.open_stage(stage, now);
                self.stage = stage;
            }
            Some(_) => {}
            None => {
                self.close_stage(now);
                self.finished_at = Some(now);
            }
        }
        Ok(())
    }

    /// Record `kind` and move to Failed at the current stage.
    pub fn fail(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        files: Vec<FailedFile>,
    ) -> Result<(), InvalidTransition> {
        if self.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: BuildStatus::Failed,
            });
        }
        self.error = Some(ErrorRecord {
            kind,
            stage: self.stage,
            message: message.into(),
            files,
            at: Utc::now(),
        });
        self.transition(BuildStatus::Failed)
    }

    /// Leave Failed for Publishing after a publisher failure.
    ///
    /// Only a build that failed with a VCS error at the Publish stage, with
    /// every task approved, may be reopened.
    pub fn reopen_for_publish(&mut self) -> Result<(), InvalidTransition> {
        let reopenable = self.status == BuildStatus::Failed
            && self.stage == Stage::Publish
            && self.error.as_ref().map(|e| e.kind) == Some(ErrorKind::Vcs)
            && !self.plan.is_empty()
            && self.plan.all_approved();
        if !reopenable {
            return Err(InvalidTransition {
                from: self.status,
                to: BuildStatus::Publishing,
            });
        }
        let now = Utc::now();
        self.status = BuildStatus::Publishing;
        self.error = None;
        self.finished_at = None;
        self.updated_at = now;
        self.open_stage(Stage::Publish, now);
        Ok(())
    }

    pub fn record_invocation(&mut self, record: InvocationRecord) {
        self.invocations.push(record);
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> BuildSummary {
        BuildSummary {
            id: self.id,
            request: self.request.clone(),
            status: self.status,
            stage: self.stage,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            total_files: self.plan.len(),
            approved_files: self.plan.count(FileStatus::Approved),
            failed_files: self.plan.count(FileStatus::Failed),
            error_kind: self.error.as_ref().map(|e| e.kind),
        }
    }

    fn close_stage(&mut self, now: DateTime<Utc>) {
        if let Some(timing) = self
            .stage_times
            .iter_mut()
            .rev()
            .find(|t| t.exited_at.is_none())
        {
            timing.exited_at = Some(now);
        }
    }

    // Re-entering a stage (Review -> Development) reopens its window.
    fn open_stage(&mut self, stage: Stage, now: DateTime<Utc>) {
        match self.stage_times.iter_mut().find(|t| t.stage == stage) {
            Some(timing) => timing.exited_at = None,
            None => self.stage_times.push(StageTiming {
                stage,
                entered_at: now,
                exited_at: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub id: BuildId,
    pub request: String,
    pub status: BuildStatus,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub total_files: usize,
    pub approved_files: usize,
    pub failed_files: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub status: Option<BuildStatus>,
    pub limit: Option<usize>,
}

impl BuildFilter {
    pub fn with_status(mut self, status: BuildStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, summary: &BuildSummary) -> bool {
        self.status.is_none_or(|s| s == summary.status)
    }
}
