//! Stage sequencing.
//!
//! [`Pipeline::advance`] performs exactly one collaborator step for the
//! build's current status and persists the outcome before returning. Domain
//! failures end up on the build's error record; only persistence failures
//! come back as `Err`, with nothing committed for the step.

use foundry_common::{
    AgentRole, Build, BuildId, BuildStatus, ErrorKind, FailedFile, FileStatus, InvocationRecord,
};
use tracing::Instrument;

use super::{CancelToken, Pipeline, dev_loop};
use crate::agent::{ArchitectRequest, CallSite, SpecifyRequest, invoke};
use crate::errors::{PipelineError, StoreError};
use crate::events::BuildEvent;
use crate::plan;
use crate::publish::{ApprovedFile, PublishRequest};
use crate::retry::with_backoff;
use crate::util::truncate;

impl Pipeline {
    /// Run one step for `build`. Terminal builds are returned unchanged.
    pub async fn advance(
        &self,
        mut build: Build,
        cancel: &CancelToken,
    ) -> Result<Build, PipelineError> {
        if build.is_terminal() {
            return Ok(build);
        }

        if self.cancel_observed(build.id, cancel).await? {
            self.cancel_build(&mut build)?;
            return self.commit(build).await;
        }

        if let Some(defect) = invariant_violation(&build) {
            tracing::error!(build_id = %build.id, status = %build.status, %defect, "invariant violation");
            self.fail_build(&mut build, ErrorKind::InvariantViolation, defect, Vec::new())?;
            return self.commit(build).await;
        }

        match build.status {
            BuildStatus::Pending => self.transition(&mut build, BuildStatus::Specifying)?,
            BuildStatus::Specifying => self.specify(&mut build, cancel).await?,
            BuildStatus::Architecting => self.architect(&mut build, cancel).await?,
            BuildStatus::Developing | BuildStatus::Reviewing => {
                return dev_loop::run(self, build, cancel).await;
            }
            BuildStatus::Publishing => self.publish(&mut build).await?,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled => {}
        }
        self.commit(build).await
    }

    /// Advance until the build is terminal.
    pub async fn run(&self, mut build: Build, cancel: &CancelToken) -> Result<Build, PipelineError> {
        let span = tracing::info_span!("build", build_id = %build.id);
        async move {
            while !build.is_terminal() {
                build = self.advance(build, cancel).await?;
            }
            Ok(build)
        }
        .instrument(span)
        .await
    }

    async fn specify(&self, build: &mut Build, cancel: &CancelToken) -> Result<(), PipelineError> {
        // Written once; never regenerated.
        if build.specification.is_some() {
            return self.transition(build, BuildStatus::Architecting);
        }

        let request = SpecifyRequest {
            request: build.request.clone(),
        };
        let specifier = self.agents.specifier.clone();
        let invocation = invoke(
            self.call_site(build, AgentRole::Specifier, None),
            || specifier.specify(&request),
        )
        .await;
        self.record(build, invocation.records);

        if self.cancel_observed(build.id, cancel).await? {
            return self.cancel_build(build);
        }

        match invocation.result {
            Ok(specification) => {
                tracing::info!(
                    build_id = %build.id,
                    features = specification.features.len(),
                    stack = %specification.stack,
                    "specification accepted"
                );
                build.specification = Some(specification);
                self.transition(build, BuildStatus::Architecting)
            }
            Err(err) => self.fail_build(
                build,
                ErrorKind::AgentInvocation,
                format!("specifier failed: {}", err),
                Vec::new(),
            ),
        }
    }

    async fn architect(&self, build: &mut Build, cancel: &CancelToken) -> Result<(), PipelineError> {
        let Some(specification) = build.specification.clone() else {
            return self.fail_build(
                build,
                ErrorKind::InvariantViolation,
                "architecting without a specification",
                Vec::new(),
            );
        };
        let request = ArchitectRequest {
            request: build.request.clone(),
            specification,
        };
        let architect = self.agents.architect.clone();
        let invocation = invoke(
            self.call_site(build, AgentRole::Architect, None),
            || architect.architect(&request),
        )
        .await;
        self.record(build, invocation.records);

        if self.cancel_observed(build.id, cancel).await? {
            return self.cancel_build(build);
        }

        let draft = match invocation.result {
            Ok(draft) => draft,
            Err(err) => {
                return self.fail_build(
                    build,
                    ErrorKind::AgentInvocation,
                    format!("architect failed: {}", err),
                    Vec::new(),
                );
            }
        };

        match plan::validate(draft) {
            Ok((file_plan, graph)) => {
                let files: Vec<String> = graph.ordered_paths().into_iter().map(String::from).collect();
                tracing::info!(build_id = %build.id, files = files.len(), "file plan accepted");
                build.plan = file_plan;
                self.events.emit(BuildEvent::PlanAccepted {
                    build_id: build.id,
                    files,
                });
                self.transition(build, BuildStatus::Developing)
            }
            Err(err) => self.fail_build(
                build,
                ErrorKind::PlanValidation,
                format!("invalid file plan: {}", err),
                Vec::new(),
            ),
        }
    }

    /// One publisher call. Never retried here.
    async fn publish(&self, build: &mut Build) -> Result<(), PipelineError> {
        let request = PublishRequest {
            build_id: build.id,
            title: build.request.clone(),
            files: build
                .plan
                .approved_files()
                .into_iter()
                .map(|(path, content)| ApprovedFile { path, content })
                .collect(),
        };

        match self.publisher.publish(&request).await {
            Ok(result) => {
                tracing::info!(build_id = %build.id, reference = %result.reference, "published");
                self.events.emit(BuildEvent::Published {
                    build_id: build.id,
                    reference: result.reference.clone(),
                });
                build.publication = Some(result);
                self.transition(build, BuildStatus::Completed)
            }
            Err(err) => self.fail_build(
                build,
                ErrorKind::Vcs,
                format!("publish failed: {}", err),
                Vec::new(),
            ),
        }
    }

    pub(crate) fn call_site<'a>(
        &'a self,
        build: &Build,
        role: AgentRole,
        target: Option<&'a str>,
    ) -> CallSite<'a> {
        CallSite {
            build_id: build.id,
            role,
            target,
            summary: format!("{} for: {}", role, truncate(&build.request, 80)),
            policy: &self.settings.retry,
            events: &self.events,
        }
    }

    pub(crate) fn record(&self, build: &mut Build, records: Vec<InvocationRecord>) {
        for record in records {
            build.record_invocation(record);
        }
    }

    pub(crate) fn cancel_build(&self, build: &mut Build) -> Result<(), PipelineError> {
        tracing::info!(build_id = %build.id, stage = %build.stage, "build cancelled");
        self.transition(build, BuildStatus::Cancelled)
    }

    pub(crate) fn fail_build(
        &self,
        build: &mut Build,
        kind: ErrorKind,
        message: impl Into<String>,
        files: Vec<FailedFile>,
    ) -> Result<(), PipelineError> {
        let message = message.into();
        let from = build.status;
        tracing::warn!(build_id = %build.id, stage = %build.stage, %kind, %message, "build failed");
        build.fail(kind, message, files)?;
        self.events.emit(BuildEvent::StatusChanged {
            build_id: build.id,
            from,
            to: BuildStatus::Failed,
        });
        Ok(())
    }

    /// Save without announcing anything. Transient store errors are retried
    /// with the pipeline's backoff.
    pub(crate) async fn persist(&self, build: &Build) -> Result<(), PipelineError> {
        with_backoff(&self.settings.retry, StoreError::is_retryable, |_| {
            self.store.save(build)
        })
        .await?;
        Ok(())
    }

    /// Put the reason a driver stopped on the last committed record.
    ///
    /// Best effort: if the store still refuses writes the record keeps its
    /// last status and a later `resume` continues from there.
    pub(crate) async fn record_driver_failure(&self, id: BuildId, err: &PipelineError) {
        let mut build = match self.store.load(id).await {
            Ok(build) => build,
            Err(load_err) => {
                tracing::error!(build_id = %id, error = %load_err, "cannot record driver failure");
                return;
            }
        };
        if build.is_terminal() {
            return;
        }
        let kind = match err {
            PipelineError::Store(_) => ErrorKind::StateStore,
            _ => ErrorKind::InvariantViolation,
        };
        let message = format!("build driver stopped: {}", err);
        if let Err(fail_err) = self.fail_build(&mut build, kind, message, Vec::new()) {
            tracing::error!(build_id = %id, error = %fail_err, "cannot record driver failure");
            return;
        }
        if let Err(save_err) = self.commit(build).await {
            tracing::error!(build_id = %id, error = %save_err, "cannot record driver failure");
        }
    }

    /// Save, announcing the end of the build if it is terminal.
    pub(crate) async fn commit(&self, build: Build) -> Result<Build, PipelineError> {
        self.persist(&build).await?;
        if build.is_terminal() {
            self.events.emit(BuildEvent::Finished {
                build_id: build.id,
                status: build.status,
                error: build.error.as_ref().map(|e| e.kind),
            });
        }
        Ok(build)
    }
}

/// A description of what is impossible about `build`, if anything.
pub fn invariant_violation(build: &Build) -> Option<String> {
    let status = build.status;
    if let Some(stage) = status.stage()
        && stage != build.stage
    {
        return Some(format!("status {} recorded at stage {}", status, build.stage));
    }

    let past_specification = matches!(
        status,
        BuildStatus::Architecting
            | BuildStatus::Developing
            | BuildStatus::Reviewing
            | BuildStatus::Publishing
    );
    if past_specification && build.specification.is_none() {
        return Some(format!("{} without a specification", status));
    }

    let has_plan = matches!(
        status,
        BuildStatus::Developing | BuildStatus::Reviewing | BuildStatus::Publishing
    );
    if has_plan && build.plan.is_empty() {
        return Some(format!("{} with an empty file plan", status));
    }

    if matches!(status, BuildStatus::Developing | BuildStatus::Reviewing)
        && build.plan.count(FileStatus::Failed) > 0
    {
        let failed: Vec<&str> = build.plan.failed_tasks().iter().map(|t| t.path.as_str()).collect();
        return Some(format!("{} with failed tasks: {}", status, failed.join(", ")));
    }

    if status == BuildStatus::Publishing && !build.plan.all_approved() {
        let pending: Vec<&str> = build
            .plan
            .tasks
            .iter()
            .filter(|t| t.status != FileStatus::Approved)
            .map(|t| t.path.as_str())
            .collect();
        return Some(format!("publishing with unapproved tasks: {}", pending.join(", ")));
    }

    None
}
