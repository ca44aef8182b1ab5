//! Agent capabilities: one trait per role, one operation each.
//!
//! The orchestrator only sees these traits. [`command::CommandAgent`] is the
//! default transport (an external CLI such as `claude --print`); tests plug in
//! deterministic stubs.

pub mod command;
pub mod prompts;
pub mod response;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use foundry_common::{
    AgentRole, BuildId, InvocationOutcome, InvocationRecord, Specification, Verdict,
};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::events::{BuildEvent, EventBus};
use crate::retry::{RetryPolicy, with_backoff};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecifyRequest {
    pub request: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectRequest {
    pub request: String,
    pub specification: Specification,
}

/// One file proposed by the Architect, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Raw Architect output. Becomes a `FilePlan` only after validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub files: Vec<PlannedFile>,
}

/// What the Coder and Reviewer are told about the file being built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    pub path: String,
    pub description: String,
    /// 1-based development attempt.
    pub attempt: u32,
}

/// Approved content of a dependency, passed as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub specification: Specification,
    pub task: TaskBrief,
    pub dependencies: Vec<DependencyFile>,
    /// Rejection reasons from earlier review rounds, oldest first.
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeArtifact {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub specification: Specification,
    pub task: TaskBrief,
    pub content: String,
    pub dependencies: Vec<DependencyFile>,
}

#[async_trait]
pub trait Specifier: Send + Sync {
    async fn specify(&self, request: &SpecifyRequest) -> Result<Specification, AgentError>;
}

#[async_trait]
pub trait Architect: Send + Sync {
    async fn architect(&self, request: &ArchitectRequest) -> Result<PlanDraft, AgentError>;
}

#[async_trait]
pub trait Coder: Send + Sync {
    async fn code(&self, request: &CodeRequest) -> Result<CodeArtifact, AgentError>;
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> Result<Verdict, AgentError>;
}

/// One implementation per role.
#[derive(Clone)]
pub struct AgentTeam {
    pub specifier: Arc<dyn Specifier>,
    pub architect: Arc<dyn Architect>,
    pub coder: Arc<dyn Coder>,
    pub reviewer: Arc<dyn Reviewer>,
}

impl AgentTeam {
    pub fn new(
        specifier: Arc<dyn Specifier>,
        architect: Arc<dyn Architect>,
        coder: Arc<dyn Coder>,
        reviewer: Arc<dyn Reviewer>,
    ) -> Self {
        Self {
            specifier,
            architect,
            coder,
            reviewer,
        }
    }
}

/// Result of a retried agent call plus one audit record per attempt.
pub struct Invocation<T> {
    pub result: Result<T, AgentError>,
    pub records: Vec<InvocationRecord>,
}

/// Where an invocation's audit records and retry events belong.
#[derive(Clone)]
pub struct CallSite<'a> {
    pub build_id: BuildId,
    pub role: AgentRole,
    pub target: Option<&'a str>,
    pub summary: String,
    pub policy: &'a RetryPolicy,
    pub events: &'a EventBus,
}

/// Call an agent under the retry policy, recording every attempt.
pub async fn invoke<T, F, Fut>(site: CallSite<'_>, mut call: F) -> Invocation<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AgentError>>,
{
    let records = Mutex::new(Vec::new());
    let records_ref = &records;
    let site_ref = &site;

    let result = with_backoff(site.policy, AgentError::is_retryable, |attempt| {
        let fut = call();
        async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = fut.await;
            let outcome = match &result {
                Ok(_) => InvocationOutcome::Succeeded,
                Err(err) => {
                    if err.is_retryable() && site_ref.policy.allows_retry_after(attempt) {
                        site_ref.events.emit(BuildEvent::AgentRetry {
                            build_id: site_ref.build_id,
                            role: site_ref.role,
                            attempt,
                            error: err.to_string(),
                        });
                    }
                    InvocationOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            let record = InvocationRecord {
                role: site_ref.role,
                target: site_ref.target.map(str::to_string),
                attempt,
                started_at,
                latency_ms: clock.elapsed().as_millis() as u64,
                summary: site_ref.summary.clone(),
                outcome,
            };
            if let Ok(mut guard) = records_ref.lock() {
                guard.push(record);
            }
            result
        }
    })
    .await;

    let records = records.into_inner().unwrap_or_default();
    Invocation { result, records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn invoke_records_every_attempt() {
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::ZERO, Duration::ZERO);
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let calls = AtomicU32::new(0);

        let invocation = invoke(
            CallSite {
                build_id: BuildId::new(),
                role: AgentRole::Coder,
                target: Some("src/lib.rs"),
                summary: "code src/lib.rs".into(),
                policy: &policy,
                events: &events,
            },
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AgentError::Transport("connection reset".into()))
                    } else {
                        Ok(CodeArtifact {
                            content: "pub fn f() {}".into(),
                        })
                    }
                }
            },
        )
        .await;

        assert!(invocation.result.is_ok());
        assert_eq!(invocation.records.len(), 2);
        assert!(!invocation.records[0].succeeded());
        assert!(invocation.records[1].succeeded());
        assert_eq!(invocation.records[1].attempt, 2);
        assert_eq!(invocation.records[0].target.as_deref(), Some("src/lib.rs"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            BuildEvent::AgentRetry { attempt: 1, .. }
        ));
    }

    #[tokio::test]
    async fn invoke_stops_on_terminal_error() {
        let policy = RetryPolicy::default()
            .with_max_attempts(5)
            .with_delays(Duration::ZERO, Duration::ZERO);
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let invocation: Invocation<Specification> = invoke(
            CallSite {
                build_id: BuildId::new(),
                role: AgentRole::Specifier,
                target: None,
                summary: "specify".into(),
                policy: &policy,
                events: &events,
            },
            || async {
                Err(AgentError::Spawn {
                    command: "missing-agent".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                })
            },
        )
        .await;

        assert!(invocation.result.is_err());
        assert_eq!(invocation.records.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invoke_announces_retries_but_not_the_final_failure() {
        let policy = RetryPolicy::default()
            .with_max_attempts(2)
            .with_delays(Duration::ZERO, Duration::ZERO);
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let invocation: Invocation<Specification> = invoke(
            CallSite {
                build_id: BuildId::new(),
                role: AgentRole::Specifier,
                target: None,
                summary: "specify".into(),
                policy: &policy,
                events: &events,
            },
            || async { Err(AgentError::Transport("connection reset".into())) },
        )
        .await;

        assert!(invocation.result.is_err());
        assert_eq!(invocation.records.len(), 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            BuildEvent::AgentRetry { attempt: 1, .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
