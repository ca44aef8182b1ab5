//! File Plan: the architecture-derived list of files a build must produce.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single file task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Pending,
    InDevelopment,
    InReview,
    Approved,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InDevelopment => "in_development",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Failed)
    }

    /// Whether a task is mid-loop (a Coder or Reviewer call may be outstanding).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InDevelopment | Self::InReview)
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_development" => Ok(Self::InDevelopment),
            "in_review" => Ok(Self::InReview),
            "approved" => Ok(Self::Approved),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid file status: {}", s)),
        }
    }
}

/// Outcome of one Reviewer invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Rejected {
        reason: String,
    },
}

impl Verdict {
    pub fn approved() -> Self {
        Self::Approved { comment: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } => Some(reason),
            Self::Approved { .. } => None,
        }
    }
}

/// One entry of a task's review history. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    /// 1-based development attempt this verdict judged.
    pub attempt: u32,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTask {
    /// Path relative to the output root; unique within a plan.
    pub path: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: FileStatus,
    /// Latest candidate, or the approved content once `status` is Approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Number of rejected review rounds so far.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub reviews: Vec<ReviewEntry>,
}

impl FileTask {
    pub fn new(path: &str, description: &str, depends_on: Vec<String>) -> Self {
        Self {
            path: path.to_string(),
            description: description.to_string(),
            depends_on,
            status: FileStatus::Pending,
            content: None,
            retries: 0,
            reviews: Vec::new(),
        }
    }

    /// Rejection reasons from every review round, oldest first.
    pub fn rejection_reasons(&self) -> Vec<String> {
        self.reviews
            .iter()
            .filter_map(|r| r.verdict.rejection_reason().map(str::to_string))
            .collect()
    }

    pub fn last_rejection(&self) -> Option<&str> {
        self.reviews
            .iter()
            .rev()
            .find_map(|r| r.verdict.rejection_reason())
    }

    /// The current development attempt, 1-based.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }
}

/// Ordered set of file tasks produced by the Architect stage.
///
/// The dependency graph is read-only once the plan has been validated; only
/// per-task status, content, retries and review history change afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePlan {
    pub tasks: Vec<FileTask>,
}

impl FilePlan {
    pub fn new(tasks: Vec<FileTask>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, path: &str) -> Option<&FileTask> {
        self.tasks.iter().find(|t| t.path == path)
    }

    pub fn task_mut(&mut self, path: &str) -> Option<&mut FileTask> {
        self.tasks.iter_mut().find(|t| t.path == path)
    }

    pub fn all_approved(&self) -> bool {
        self.tasks.iter().all(|t| t.status == FileStatus::Approved)
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn failed_tasks(&self) -> Vec<&FileTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == FileStatus::Failed)
            .collect()
    }

    /// `(path, content)` for every approved task, in plan order.
    pub fn approved_files(&self) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .filter(|t| t.status == FileStatus::Approved)
            .filter_map(|t| t.content.clone().map(|c| (t.path.clone(), c)))
            .collect()
    }
}
