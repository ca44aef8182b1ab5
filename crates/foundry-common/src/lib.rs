//! Shared domain types for the Foundry delivery pipeline.
//!
//! Everything here is plain data plus the pure state transitions on it. The
//! orchestrator crate owns the I/O (agents, persistence, publishing); this
//! crate only knows what a build *is* and which transitions are legal.

pub mod build;
pub mod invocation;
pub mod plan;

pub use build::{
    Build, BuildFilter, BuildId, BuildStatus, BuildSummary, ErrorKind, ErrorRecord, FailedFile,
    InvalidTransition, PublicationResult, PublishedFile, Specification, Stage, StageTiming,
};
pub use invocation::{AgentRole, InvocationOutcome, InvocationRecord};
pub use plan::{FilePlan, FileStatus, FileTask, ReviewEntry, Verdict};
