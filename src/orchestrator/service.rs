//! Build lifecycle operations.
//!
//! [`BuildService`] is built once at process start. It owns the pipeline
//! (store, agents, publisher) and the table of builds driven by this
//! process. Each driven build also holds a lock file so a second process
//! cannot drive it at the same time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use foundry_common::{
    Build, BuildFilter, BuildId, BuildStatus, BuildSummary, ErrorRecord, FileStatus,
    PublicationResult, Specification, Stage, StageTiming,
};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::lock::{self, BuildLock};
use super::{CancelToken, Pipeline, PipelineSettings};
use crate::agent::command::team_from_config;
use crate::config::{FoundryConfig, StoreBackend};
use crate::errors::PipelineError;
use crate::events::{BuildEvent, EventBus};
use crate::plan::{FileGraph, wave_of_each};
use crate::publish;
use crate::store::{BuildStore, MemoryBuildStore, SqliteBuildStore};
use crate::util::sha256_hex;

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub status: FileStatus,
    pub depends_on: Vec<String>,
    /// Position in the dependency waves, 0-based.
    pub wave: Option<usize>,
    pub retries: u32,
    pub reviews: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rejection: Option<String>,
    /// SHA-256 of the approved content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Everything `status` shows about one build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildStatusReport {
    pub id: BuildId,
    pub request: String,
    pub status: BuildStatus,
    pub stage: Stage,
    pub running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stage_times: Vec<StageTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specification: Option<Specification>,
    pub files: Vec<FileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<PublicationResult>,
    pub invocations: usize,
    pub failed_invocations: usize,
}

impl BuildStatusReport {
    pub fn from_build(build: &Build, running: bool) -> Self {
        let waves = FileGraph::build(&build.plan.tasks)
            .map(|graph| wave_of_each(&graph))
            .ok();
        let files = build
            .plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| FileReport {
                path: task.path.clone(),
                status: task.status,
                depends_on: task.depends_on.clone(),
                wave: waves.as_ref().and_then(|w| w.get(i).copied()),
                retries: task.retries,
                reviews: task.reviews.len(),
                last_rejection: task.last_rejection().map(str::to_string),
                digest: (task.status == FileStatus::Approved)
                    .then(|| task.content.as_deref().map(sha256_hex))
                    .flatten(),
            })
            .collect();

        Self {
            id: build.id,
            request: build.request.clone(),
            status: build.status,
            stage: build.stage,
            running,
            created_at: build.created_at,
            updated_at: build.updated_at,
            finished_at: build.finished_at,
            stage_times: build.stage_times.clone(),
            specification: build.specification.clone(),
            files,
            error: build.error.clone(),
            publication: build.publication.clone(),
            invocations: build.invocations.len(),
            failed_invocations: build.invocations.iter().filter(|r| !r.succeeded()).count(),
        }
    }
}

struct RunningBuild {
    cancel: CancelToken,
    done: watch::Receiver<bool>,
}

/// Right to drive one build, held from claim until the driver exits.
struct Claim {
    id: BuildId,
    cancel: CancelToken,
    done: watch::Sender<bool>,
    lock: Option<BuildLock>,
}

pub struct BuildService {
    pipeline: Pipeline,
    running: Arc<Mutex<HashMap<BuildId, RunningBuild>>>,
    lock_dir: Option<PathBuf>,
}

impl BuildService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            running: Arc::new(Mutex::new(HashMap::new())),
            lock_dir: None,
        }
    }

    /// Also take a lock file per driven build.
    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock_dir = Some(dir);
        self
    }

    /// Wire store, agents and publisher from configuration.
    pub fn from_config(config: &FoundryConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn BuildStore> = match config.toml.store.backend {
            StoreBackend::Sqlite => Arc::new(SqliteBuildStore::open(&config.store_path())?),
            StoreBackend::Memory => Arc::new(MemoryBuildStore::new()),
        };
        let pipeline = Pipeline::new(
            store,
            team_from_config(config),
            publish::from_config(config),
            PipelineSettings::from_config(config),
        );
        let service = Self::new(pipeline);
        Ok(match config.toml.store.backend {
            StoreBackend::Sqlite => service.with_lock_dir(config.lock_dir()),
            StoreBackend::Memory => service,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn events(&self) -> &EventBus {
        &self.pipeline.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.pipeline.events.subscribe()
    }

    /// Accept a request and start driving it. Returns once the build is
    /// persisted.
    pub async fn submit(&self, request: &str) -> Result<BuildId, PipelineError> {
        let build = accept(request)?;
        let id = build.id;
        let claim = self.claim(id)?;
        if let Err(err) = self.record_submission(&build).await {
            self.release(id);
            return Err(err);
        }
        self.launch(claim, build);
        Ok(id)
    }

    /// Persist a Pending build without driving it; `resume` starts it.
    pub async fn create(&self, request: &str) -> Result<BuildId, PipelineError> {
        let build = accept(request)?;
        self.record_submission(&build).await?;
        Ok(build.id)
    }

    async fn record_submission(&self, build: &Build) -> Result<(), PipelineError> {
        self.pipeline.store.save(build).await?;
        tracing::info!(build_id = %build.id, "build submitted");
        self.pipeline.events.emit(BuildEvent::Submitted {
            build_id: build.id,
            request: build.request.clone(),
        });
        Ok(())
    }

    pub async fn get_status(&self, id: BuildId) -> Result<BuildStatusReport, PipelineError> {
        let build = self.pipeline.store.load(id).await?;
        Ok(BuildStatusReport::from_build(&build, self.is_running(id)))
    }

    /// Stop a build. Returns false when the build had already finished.
    ///
    /// A build driven by this process stops at its next boundary. One driven
    /// by another process sees the persisted request at its next boundary.
    /// A build nobody is driving is moved to Cancelled right away.
    pub async fn cancel(&self, id: BuildId) -> Result<bool, PipelineError> {
        let build = self.pipeline.store.load(id).await?;
        if build.is_terminal() {
            return Ok(false);
        }
        self.pipeline.store.request_cancel(id).await?;
        tracing::info!(build_id = %id, status = %build.status, "cancellation requested");

        if let Some(token) = self.cancel_token(id) {
            token.cancel();
            return Ok(true);
        }
        match self.claim(id) {
            Ok(claim) => {
                let result = self.cancel_idle(id).await;
                self.release(id);
                drop(claim);
                result
            }
            // Another driver owns it and will observe the persisted request.
            Err(PipelineError::Locked { .. } | PipelineError::AlreadyRunning(_)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Cancel a build while holding its claim, so no driver can start.
    async fn cancel_idle(&self, id: BuildId) -> Result<bool, PipelineError> {
        let mut build = self.pipeline.store.load(id).await?;
        if build.is_terminal() {
            return Ok(false);
        }
        self.pipeline.cancel_build(&mut build)?;
        self.pipeline.commit(build).await?;
        Ok(true)
    }

    fn cancel_token(&self, id: BuildId) -> Option<CancelToken> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.get(&id).map(|entry| entry.cancel.clone()))
    }

    /// Delete one finished build. Returns false when it did not exist.
    pub async fn delete(&self, id: BuildId) -> Result<bool, PipelineError> {
        let build = self.pipeline.store.load(id).await?;
        if !build.is_terminal() {
            return Err(PipelineError::NotFinished {
                id,
                status: build.status,
            });
        }
        let deleted = self.pipeline.store.delete(id).await?;
        if let Some(dir) = &self.lock_dir {
            lock::remove_stale(dir, id);
        }
        tracing::info!(build_id = %id, deleted, "build deleted");
        Ok(deleted)
    }

    pub async fn list(&self, filter: &BuildFilter) -> Result<Vec<BuildSummary>, PipelineError> {
        Ok(self.pipeline.store.list(filter).await?)
    }

    /// Continue a non-terminal build from its persisted status.
    ///
    /// With `republish`, a build that failed while publishing goes back to
    /// Publishing and only the publish step runs again.
    pub async fn resume(&self, id: BuildId, republish: bool) -> Result<(), PipelineError> {
        let claim = self.claim(id)?;
        match self.prepare_resume(id, republish).await {
            Ok(build) => {
                self.launch(claim, build);
                Ok(())
            }
            Err(err) => {
                self.release(id);
                Err(err)
            }
        }
    }

    async fn prepare_resume(&self, id: BuildId, republish: bool) -> Result<Build, PipelineError> {
        let mut build = self.pipeline.store.load(id).await?;
        if republish {
            let status = build.status;
            build
                .reopen_for_publish()
                .map_err(|_| PipelineError::NotResumable { id, status })?;
            self.pipeline.store.save(&build).await?;
            tracing::info!(build_id = %id, "reopened for publishing");
            self.pipeline.events.emit(BuildEvent::StatusChanged {
                build_id: id,
                from: status,
                to: BuildStatus::Publishing,
            });
        } else if build.is_terminal() {
            return Err(PipelineError::NotResumable {
                id,
                status: build.status,
            });
        }
        tracing::info!(build_id = %id, status = %build.status, "resuming build");
        Ok(build)
    }

    /// The build once its driver in this process has stopped, or its
    /// current record if nothing here is driving it.
    pub async fn wait(&self, id: BuildId) -> Result<Build, PipelineError> {
        let done = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(&id).map(|r| r.done.clone()));
        if let Some(mut done) = done {
            // An error means the driver is gone; the record says the rest.
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(self.pipeline.store.load(id).await?)
    }

    /// Delete terminal builds that finished more than `older_than` ago.
    pub async fn cleanup(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<BuildId>, PipelineError> {
        let cutoff = Utc::now() - older_than;
        let removed = self.pipeline.store.purge_terminal_before(cutoff).await?;
        if let Some(dir) = &self.lock_dir {
            for id in &removed {
                lock::remove_stale(dir, *id);
            }
        }
        tracing::info!(removed = removed.len(), %cutoff, "retention cleanup");
        Ok(removed)
    }

    pub fn is_running(&self, id: BuildId) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(&id))
            .unwrap_or(false)
    }

    fn claim(&self, id: BuildId) -> Result<Claim, PipelineError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("running-build table poisoned")))?;
        if running.contains_key(&id) {
            return Err(PipelineError::AlreadyRunning(id));
        }
        let lock = match &self.lock_dir {
            Some(dir) => Some(lock::try_lock(dir, id)?),
            None => None,
        };
        let cancel = CancelToken::new();
        let (done, done_rx) = watch::channel(false);
        running.insert(
            id,
            RunningBuild {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        Ok(Claim {
            id,
            cancel,
            done,
            lock,
        })
    }

    fn release(&self, id: BuildId) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&id);
        }
    }

    fn launch(&self, claim: Claim, build: Build) {
        let pipeline = self.pipeline.clone();
        let table = self.running.clone();
        tokio::spawn(async move {
            let Claim {
                id,
                cancel,
                done,
                lock,
            } = claim;
            match pipeline.run(build, &cancel).await {
                Ok(build) => tracing::info!(
                    build_id = %id,
                    status = %build.status,
                    error = ?build.error.as_ref().map(|e| e.kind),
                    "build driver finished"
                ),
                Err(err) => {
                    tracing::error!(build_id = %id, error = %err, "build driver stopped");
                    pipeline.record_driver_failure(id, &err).await;
                }
            }
            drop(lock);
            if let Ok(mut running) = table.lock() {
                running.remove(&id);
            }
            done.send_replace(true);
        });
    }
}

fn accept(request: &str) -> Result<Build, PipelineError> {
    let request = request.trim();
    if request.is_empty() {
        return Err(PipelineError::BadRequest("request text is empty".to_string()));
    }
    Ok(Build::new(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::orchestrator::testing::{FlakyStore, StubAgents, harness};
    use foundry_common::ErrorKind;

    #[tokio::test]
    async fn submit_then_wait_completes() {
        let agents = StubAgents::todo_api();
        let (pipeline, publisher) = harness(&agents);
        let service = BuildService::new(pipeline);

        let id = service.submit("build a todo API").await.unwrap();
        let build = service.wait(id).await.unwrap();

        assert_eq!(build.status, BuildStatus::Completed);
        assert_eq!(publisher.calls(), 1);
        assert!(!service.is_running(id));

        let report = service.get_status(id).await.unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.files[0].wave, Some(0));
        assert_eq!(report.files[1].wave, Some(1));
        assert!(report.files.iter().all(|f| f.digest.is_some()));
        assert!(report.publication.is_some());
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline);
        assert!(matches!(
            service.submit("   ").await,
            Err(PipelineError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn created_build_waits_for_resume() {
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline);

        let id = service.create("build a todo API").await.unwrap();
        assert!(!service.is_running(id));
        assert_eq!(
            service.get_status(id).await.unwrap().status,
            BuildStatus::Pending
        );
        assert!(agents.calls().is_empty());

        service.resume(id, false).await.unwrap();
        assert_eq!(service.wait(id).await.unwrap().status, BuildStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_build_cannot_be_resumed_or_cancelled() {
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline);
        let id = service.submit("build a todo API").await.unwrap();
        service.wait(id).await.unwrap();

        assert!(!service.cancel(id).await.unwrap());
        assert!(matches!(
            service.resume(id, false).await,
            Err(PipelineError::NotResumable { .. })
        ));
        assert!(matches!(
            service.resume(id, true).await,
            Err(PipelineError::NotResumable { .. })
        ));
        assert!(!service.is_running(id));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_builds() {
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline);
        let done = service.submit("build a todo API").await.unwrap();
        service.wait(done).await.unwrap();
        let pending = Build::new("not started");
        service.pipeline().store.save(&pending).await.unwrap();

        assert!(service.cleanup(chrono::Duration::days(1)).await.unwrap().is_empty());
        let removed = service.cleanup(chrono::Duration::zero()).await.unwrap();
        assert_eq!(removed, vec![done]);
        assert!(service.get_status(pending.id).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_of_idle_build_finishes_it() {
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline);
        let mut events = service.subscribe();

        let id = service.create("build a todo API").await.unwrap();
        assert!(service.cancel(id).await.unwrap());

        let report = service.get_status(id).await.unwrap();
        assert_eq!(report.status, BuildStatus::Cancelled);
        assert_eq!(report.stage, Stage::Specification);
        assert!(report.finished_at.is_some());
        assert!(!service.is_running(id));
        assert!(agents.calls().is_empty());

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BuildEvent::Finished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);

        assert!(!service.cancel(id).await.unwrap());
        assert_eq!(service.cleanup(chrono::Duration::zero()).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn cancel_of_idle_build_locked_elsewhere_only_records_request() {
        let dir = tempfile::tempdir().unwrap();
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline).with_lock_dir(dir.path().to_path_buf());

        let id = service.create("build a todo API").await.unwrap();
        let _other_driver = lock::try_lock(dir.path(), id).unwrap();

        assert!(service.cancel(id).await.unwrap());
        assert_eq!(
            service.get_status(id).await.unwrap().status,
            BuildStatus::Pending
        );
        assert!(service.pipeline().store.cancel_requested(id).await.unwrap());
    }

    #[tokio::test]
    async fn transient_save_failure_is_retried() {
        let agents = StubAgents::todo_api();
        let (mut pipeline, _publisher) = harness(&agents);
        pipeline.store = Arc::new(FlakyStore::failing_saves([3]));
        let service = BuildService::new(pipeline);

        let id = service.submit("build a todo API").await.unwrap();
        let build = service.wait(id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Completed);
    }

    #[tokio::test]
    async fn persistent_save_failure_is_recorded_on_the_build() {
        let agents = StubAgents::todo_api();
        let (mut pipeline, publisher) = harness(&agents);
        // Save 1 is the submission, 2 enters Specifying, 3 and 4 are the
        // attempts to commit the specification.
        pipeline.store = Arc::new(FlakyStore::failing_saves([3, 4]));
        let service = BuildService::new(pipeline);

        let id = service.submit("build a todo API").await.unwrap();
        let build = service.wait(id).await.unwrap();

        assert_eq!(build.status, BuildStatus::Failed);
        let error = build.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StateStore);
        assert_eq!(error.stage, Stage::Specification);
        assert!(error.message.contains("database is locked"));
        assert!(!service.is_running(id));
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn delete_removes_only_finished_builds() {
        let agents = StubAgents::todo_api();
        let (pipeline, _publisher) = harness(&agents);
        let service = BuildService::new(pipeline);

        let pending = service.create("not started").await.unwrap();
        assert!(matches!(
            service.delete(pending).await,
            Err(PipelineError::NotFinished { .. })
        ));

        let done = service.submit("build a todo API").await.unwrap();
        service.wait(done).await.unwrap();
        assert!(service.delete(done).await.unwrap());
        assert!(matches!(
            service.get_status(done).await,
            Err(PipelineError::Store(StoreError::NotFound(_)))
        ));
        assert!(service.get_status(pending).await.is_ok());
    }
}
