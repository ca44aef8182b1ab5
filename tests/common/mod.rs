//! Shared collaborators for pipeline integration tests.
//!
//! `ScriptedAgents` answers every role deterministically from a small script
//! and records what it was asked. `RecordingPublisher` keeps every publish
//! request and can be told to fail.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use foundry::agent::{
    AgentTeam, Architect, ArchitectRequest, CodeArtifact, CodeRequest, Coder, PlanDraft,
    PlannedFile, ReviewRequest, Reviewer, Specifier, SpecifyRequest,
};
use foundry::errors::{AgentError, PublishError};
use foundry::publish::{PublishRequest, Publisher};
use foundry::retry::RetryPolicy;
use foundry::store::MemoryBuildStore;
use foundry::{BuildService, Pipeline, PipelineSettings};
use foundry_common::{AgentRole, PublicationResult, Specification, Verdict};
use tokio::sync::Notify;

pub fn file(path: &str, depends_on: &[&str]) -> PlannedFile {
    PlannedFile {
        path: path.to_string(),
        description: format!("implement {}", path),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
    }
}

/// Plan of the "todo API" example: models, then storage and routes on top.
pub fn todo_plan() -> Vec<PlannedFile> {
    vec![
        file("src/models.rs", &[]),
        file("src/store.rs", &["src/models.rs"]),
        file("src/routes.rs", &["src/models.rs", "src/store.rs"]),
        file("README.md", &[]),
    ]
}

/// Holds the coder for one path until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct Script {
    plan: Vec<PlannedFile>,
    failing: HashSet<AgentRole>,
    reject_always: HashSet<String>,
    reject_first: HashMap<String, u32>,
    coder_delay: Duration,
    gates: HashMap<String, Arc<Gate>>,
}

#[derive(Default)]
struct Journal {
    calls: Vec<(AgentRole, Option<String>)>,
    code_requests: Vec<CodeRequest>,
    review_requests: Vec<ReviewRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedAgents {
    script: Arc<Script>,
    journal: Arc<Mutex<Journal>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedAgents {
    pub fn new(plan: Vec<PlannedFile>) -> Self {
        Self {
            script: Arc::new(Script {
                plan,
                ..Script::default()
            }),
            ..Self::default()
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut Script)) -> Self {
        let script = Arc::get_mut(&mut self.script).expect("configure before use");
        f(script);
        self
    }

    pub fn failing(self, role: AgentRole) -> Self {
        self.edit(|s| {
            s.failing.insert(role);
        })
    }

    pub fn always_rejecting(self, path: &str) -> Self {
        self.edit(|s| {
            s.reject_always.insert(path.to_string());
        })
    }

    /// Reject the first `times` candidates for `path`.
    pub fn rejecting(self, path: &str, times: u32) -> Self {
        self.edit(|s| {
            s.reject_first.insert(path.to_string(), times);
        })
    }

    pub fn with_coder_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.coder_delay = delay)
    }

    pub fn gated(self, path: &str, gate: Arc<Gate>) -> Self {
        self.edit(|s| {
            s.gates.insert(path.to_string(), gate);
        })
    }

    pub fn team(&self) -> AgentTeam {
        let shared = Arc::new(self.clone());
        AgentTeam::new(shared.clone(), shared.clone(), shared.clone(), shared)
    }

    pub fn calls(&self) -> Vec<(AgentRole, Option<String>)> {
        self.journal.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, role: AgentRole) -> usize {
        self.calls().iter().filter(|(r, _)| *r == role).count()
    }

    pub fn code_requests_for(&self, path: &str) -> Vec<CodeRequest> {
        self.journal
            .lock()
            .unwrap()
            .code_requests
            .iter()
            .filter(|r| r.task.path == path)
            .cloned()
            .collect()
    }

    pub fn review_requests(&self) -> Vec<ReviewRequest> {
        self.journal.lock().unwrap().review_requests.clone()
    }

    /// Highest number of coder calls seen running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, role: AgentRole, target: Option<&str>) -> Result<(), AgentError> {
        self.journal
            .lock()
            .unwrap()
            .calls
            .push((role, target.map(str::to_string)));
        if self.script.failing.contains(&role) {
            return Err(AgentError::Transport(format!("{} unavailable", role)));
        }
        Ok(())
    }
}

pub fn specification() -> Specification {
    Specification {
        summary: "A todo API with persistence".into(),
        features: vec![
            "create todos".into(),
            "list todos".into(),
            "complete todos".into(),
        ],
        stack: "rust".into(),
    }
}

/// Deterministic content for a file given its dependencies.
pub fn content_for(path: &str, dependencies: &[(String, String)]) -> String {
    let mut content = format!("// {}\n", path);
    for (dep, dep_content) in dependencies {
        content.push_str(&format!("// uses {} ({} bytes)\n", dep, dep_content.len()));
    }
    content
}

#[async_trait]
impl Specifier for ScriptedAgents {
    async fn specify(&self, _request: &SpecifyRequest) -> Result<Specification, AgentError> {
        self.enter(AgentRole::Specifier, None)?;
        Ok(specification())
    }
}

#[async_trait]
impl Architect for ScriptedAgents {
    async fn architect(&self, _request: &ArchitectRequest) -> Result<PlanDraft, AgentError> {
        self.enter(AgentRole::Architect, None)?;
        Ok(PlanDraft {
            files: self.script.plan.clone(),
        })
    }
}

#[async_trait]
impl Coder for ScriptedAgents {
    async fn code(&self, request: &CodeRequest) -> Result<CodeArtifact, AgentError> {
        self.enter(AgentRole::Coder, Some(&request.task.path))?;
        self.journal
            .lock()
            .unwrap()
            .code_requests
            .push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = self.script.gates.get(&request.task.path) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if !self.script.coder_delay.is_zero() {
            tokio::time::sleep(self.script.coder_delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let deps: Vec<(String, String)> = request
            .dependencies
            .iter()
            .map(|d| (d.path.clone(), d.content.clone()))
            .collect();
        Ok(CodeArtifact {
            content: content_for(&request.task.path, &deps),
        })
    }
}

#[async_trait]
impl Reviewer for ScriptedAgents {
    async fn review(&self, request: &ReviewRequest) -> Result<Verdict, AgentError> {
        self.enter(AgentRole::Reviewer, Some(&request.task.path))?;
        self.journal
            .lock()
            .unwrap()
            .review_requests
            .push(request.clone());
        let path = &request.task.path;
        if self.script.reject_always.contains(path) {
            return Ok(Verdict::rejected(format!("{} is incomplete", path)));
        }
        if let Some(times) = self.script.reject_first.get(path)
            && request.task.attempt <= *times
        {
            return Ok(Verdict::rejected(format!(
                "{} attempt {} misses validation",
                path, request.task.attempt
            )));
        }
        Ok(Verdict::approved())
    }
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    requests: Arc<Mutex<Vec<PublishRequest>>>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingPublisher {
    /// Fail the next `times` publish calls with a push error.
    pub fn failing_times(times: usize) -> Self {
        Self {
            failures_left: Arc::new(AtomicUsize::new(times)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublicationResult, PublishError> {
        self.requests.lock().unwrap().push(request.clone());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError::Push {
                branch: format!("foundry/build-{}", request.build_id.short()),
                stderr: "remote rejected".into(),
            });
        }
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

pub fn settings(max_parallel: usize) -> PipelineSettings {
    PipelineSettings {
        max_parallel,
        max_review_retries: 3,
        retry: RetryPolicy::default()
            .with_max_attempts(2)
            .with_delays(Duration::ZERO, Duration::ZERO),
    }
}

pub fn service_with(
    agents: &ScriptedAgents,
    publisher: &RecordingPublisher,
    settings: PipelineSettings,
) -> BuildService {
    let pipeline = Pipeline::new(
        Arc::new(MemoryBuildStore::new()),
        agents.team(),
        Arc::new(publisher.clone()),
        settings,
    );
    BuildService::new(pipeline)
}

pub fn service(agents: &ScriptedAgents) -> (BuildService, RecordingPublisher) {
    let publisher = RecordingPublisher::default();
    let service = service_with(agents, &publisher, settings(4));
    (service, publisher)
}
