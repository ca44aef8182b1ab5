//! Deterministic collaborators for orchestrator unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foundry_common::{
    AgentRole, Build, BuildFilter, BuildId, BuildStatus, BuildSummary, PublicationResult,
    Specification, Verdict,
};

use super::{Pipeline, PipelineSettings};
use crate::agent::{
    AgentTeam, Architect, ArchitectRequest, CodeArtifact, CodeRequest, Coder, PlanDraft,
    PlannedFile, ReviewRequest, Reviewer, Specifier, SpecifyRequest,
};
use crate::errors::{AgentError, PublishError, StoreError};
use crate::publish::{PublishRequest, Publisher};
use crate::retry::RetryPolicy;
use crate::store::{BuildStore, MemoryBuildStore};

#[derive(Default)]
struct Log {
    calls: Vec<(AgentRole, Option<String>)>,
    code_requests: Vec<CodeRequest>,
}

#[derive(Clone, Default)]
pub struct StubAgents {
    files: Vec<PlannedFile>,
    failing: Option<AgentRole>,
    reject_always: HashSet<String>,
    reject_once: HashSet<String>,
    log: Arc<Mutex<Log>>,
}

impl StubAgents {
    /// `src/models.rs` and `src/routes.rs`, the latter depending on the former.
    pub fn todo_api() -> Self {
        Self {
            files: vec![
                PlannedFile {
                    path: "src/models.rs".into(),
                    description: "Todo model".into(),
                    depends_on: vec![],
                },
                PlannedFile {
                    path: "src/routes.rs".into(),
                    description: "HTTP routes".into(),
                    depends_on: vec!["src/models.rs".into()],
                },
            ],
            ..Self::default()
        }
    }

    pub fn failing(mut self, role: AgentRole) -> Self {
        self.failing = Some(role);
        self
    }

    pub fn always_rejecting(mut self, path: &str) -> Self {
        self.reject_always.insert(path.to_string());
        self
    }

    pub fn rejecting_once(mut self, path: &str) -> Self {
        self.reject_once.insert(path.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(AgentRole, Option<String>)> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn code_requests_for(&self, path: &str) -> Vec<CodeRequest> {
        self.log
            .lock()
            .unwrap()
            .code_requests
            .iter()
            .filter(|r| r.task.path == path)
            .cloned()
            .collect()
    }

    pub fn team(&self) -> AgentTeam {
        let shared = Arc::new(self.clone());
        AgentTeam::new(shared.clone(), shared.clone(), shared.clone(), shared)
    }

    fn enter(&self, role: AgentRole, target: Option<&str>) -> Result<(), AgentError> {
        self.log
            .lock()
            .unwrap()
            .calls
            .push((role, target.map(str::to_string)));
        if self.failing == Some(role) {
            return Err(AgentError::Transport(format!("{} unavailable", role)));
        }
        Ok(())
    }
}

pub fn specification() -> Specification {
    Specification {
        summary: "A small todo API".into(),
        features: vec![
            "create todos".into(),
            "list todos".into(),
            "complete todos".into(),
        ],
        stack: "rust".into(),
    }
}

#[async_trait]
impl Specifier for StubAgents {
    async fn specify(&self, _request: &SpecifyRequest) -> Result<Specification, AgentError> {
        self.enter(AgentRole::Specifier, None)?;
        Ok(specification())
    }
}

#[async_trait]
impl Architect for StubAgents {
    async fn architect(&self, _request: &ArchitectRequest) -> Result<PlanDraft, AgentError> {
        self.enter(AgentRole::Architect, None)?;
        Ok(PlanDraft {
            files: self.files.clone(),
        })
    }
}

#[async_trait]
impl Coder for StubAgents {
    async fn code(&self, request: &CodeRequest) -> Result<CodeArtifact, AgentError> {
        self.enter(AgentRole::Coder, Some(&request.task.path))?;
        self.log.lock().unwrap().code_requests.push(request.clone());
        let mut content = format!("// {}\n", request.task.path);
        for dep in &request.dependencies {
            content.push_str(&format!("// uses {} ({} bytes)\n", dep.path, dep.content.len()));
        }
        Ok(CodeArtifact { content })
    }
}

#[async_trait]
impl Reviewer for StubAgents {
    async fn review(&self, request: &ReviewRequest) -> Result<Verdict, AgentError> {
        self.enter(AgentRole::Reviewer, Some(&request.task.path))?;
        let path = &request.task.path;
        if self.reject_always.contains(path)
            || (self.reject_once.contains(path) && request.task.attempt == 1)
        {
            return Ok(Verdict::rejected(format!("{} lacks error handling", path)));
        }
        Ok(Verdict::approved())
    }
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    requests: Arc<Mutex<Vec<PublishRequest>>>,
}

impl RecordingPublisher {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublicationResult, PublishError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PublicationResult {
            reference: format!("recorded/{}", request.build_id),
            branch: None,
            commit: None,
            url: None,
            files: request.published_files(),
            published_at: chrono::Utc::now(),
        })
    }
}

/// A memory store whose saves fail for the given 1-based save numbers.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryBuildStore,
    failing_saves: HashSet<usize>,
    saves: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_saves(saves: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing_saves: saves.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BuildStore for FlakyStore {
    async fn load(&self, id: BuildId) -> Result<Build, StoreError> {
        self.inner.load(id).await
    }

    async fn save(&self, build: &Build) -> Result<(), StoreError> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_saves.contains(&n) {
            return Err(StoreError::Database(anyhow::anyhow!("database is locked")));
        }
        self.inner.save(build).await
    }

    async fn list(&self, filter: &BuildFilter) -> Result<Vec<BuildSummary>, StoreError> {
        self.inner.list(filter).await
    }

    async fn request_cancel(&self, id: BuildId) -> Result<(), StoreError> {
        self.inner.request_cancel(id).await
    }

    async fn cancel_requested(&self, id: BuildId) -> Result<bool, StoreError> {
        self.inner.cancel_requested(id).await
    }

    async fn delete(&self, id: BuildId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildId>, StoreError> {
        self.inner.purge_terminal_before(cutoff).await
    }
}

pub fn harness(agents: &StubAgents) -> (Pipeline, RecordingPublisher) {
    let publisher = RecordingPublisher::default();
    let settings = PipelineSettings {
        max_parallel: 4,
        max_review_retries: 3,
        retry: RetryPolicy::default()
            .with_max_attempts(2)
            .with_delays(Duration::ZERO, Duration::ZERO),
    };
    let pipeline = Pipeline::new(
        Arc::new(MemoryBuildStore::new()),
        agents.team(),
        Arc::new(publisher.clone()),
        settings,
    );
    (pipeline, publisher)
}

/// A build that has just entered Development with the stub's plan.
pub fn build_at_development(agents: &StubAgents) -> Build {
    let mut build = Build::new("build a todo API");
    build.specification = Some(specification());
    let (plan, _graph) = crate::plan::validate(PlanDraft {
        files: agents.files.clone(),
    })
    .unwrap();
    build.plan = plan;
    for status in [
        BuildStatus::Specifying,
        BuildStatus::Architecting,
        BuildStatus::Developing,
    ] {
        build.transition(status).unwrap();
    }
    build
}
