//! Per-file development and review.
//!
//! The loop is a single-writer actor. The owner (the caller of [`run`])
//! holds the build, decides which tasks start, and applies every update.
//! Workers run one development round each (Coder, then Reviewer) and report
//! back over a channel; they never touch the build themselves.
//!
//! Once a task fails or the build is cancelled, no further rounds start and
//! no worker makes another agent call. Rounds already in flight finish their
//! current call and their results are dropped.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use foundry_common::{
    AgentRole, Build, BuildId, BuildStatus, ErrorKind, FailedFile, FileStatus, InvocationRecord,
    ReviewEntry, Specification, Verdict,
};
use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};

use super::{CancelToken, Pipeline};
use crate::agent::{
    AgentTeam, CallSite, CodeRequest, DependencyFile, ReviewRequest, TaskBrief, invoke,
};
use crate::errors::PipelineError;
use crate::events::{BuildEvent, EventBus};
use crate::plan::{FileGraph, TaskIndex, ready_tasks};
use crate::retry::RetryPolicy;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Messages from workers to the owner.
#[derive(Debug)]
enum TaskUpdate {
    Invoked(Vec<InvocationRecord>),
    Candidate {
        index: TaskIndex,
        attempt: u32,
        content: String,
    },
    // The three below end a round.
    Reviewed {
        index: TaskIndex,
        attempt: u32,
        verdict: Verdict,
    },
    Failed {
        index: TaskIndex,
        reason: String,
    },
    Abandoned {
        index: TaskIndex,
    },
}

/// Why the loop stopped starting rounds.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed {
        kind: ErrorKind,
        message: String,
        files: Vec<FailedFile>,
    },
}

/// Snapshot handed to a worker for one round.
struct Round {
    index: TaskIndex,
    brief: TaskBrief,
    dependencies: Vec<DependencyFile>,
    feedback: Vec<String>,
}

/// Shared, read-only context of every worker.
#[derive(Clone)]
struct WorkerContext {
    build_id: BuildId,
    agents: AgentTeam,
    specification: Specification,
    policy: RetryPolicy,
    events: EventBus,
    cancel: CancelToken,
    halt: CancelToken,
}

impl WorkerContext {
    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.halt.is_cancelled()
    }
}

/// Drive every task to Approved or Failed, then move the build on.
///
/// Returns the build in Publishing, Failed, or Cancelled. The build is saved
/// after every applied update.
pub async fn run(
    pipeline: &Pipeline,
    build: Build,
    cancel: &CancelToken,
) -> Result<Build, PipelineError> {
    let mut owner = match Owner::new(pipeline, build, cancel) {
        Ok(owner) => owner,
        Err((mut build, defect)) => {
            tracing::error!(build_id = %build.id, %defect, "invariant violation");
            pipeline.fail_build(&mut build, ErrorKind::InvariantViolation, defect, Vec::new())?;
            return pipeline.commit(build).await;
        }
    };
    owner.drive().await?;
    owner.finish().await
}

struct Owner<'p> {
    pipeline: &'p Pipeline,
    build: Build,
    graph: FileGraph,
    context: WorkerContext,
    semaphore: Arc<Semaphore>,
    active: HashSet<TaskIndex>,
    retry_queue: VecDeque<TaskIndex>,
    halt: Option<Halt>,
    tx: mpsc::Sender<TaskUpdate>,
    rx: mpsc::Receiver<TaskUpdate>,
}

impl<'p> Owner<'p> {
    fn new(
        pipeline: &'p Pipeline,
        mut build: Build,
        cancel: &CancelToken,
    ) -> Result<Self, (Build, String)> {
        let graph = match FileGraph::build(&build.plan.tasks) {
            Ok(graph) => graph,
            Err(err) => return Err((build, format!("stored plan is invalid: {}", err))),
        };
        let Some(specification) = build.specification.clone() else {
            return Err((build, "development without a specification".to_string()));
        };

        // Rounds interrupted by a crash start over.
        let mut retry_queue = VecDeque::new();
        for &index in graph.order() {
            let task = &mut build.plan.tasks[index];
            if task.status.is_active() {
                task.status = FileStatus::InDevelopment;
                retry_queue.push_back(index);
            }
        }

        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let context = WorkerContext {
            build_id: build.id,
            agents: pipeline.agents.clone(),
            specification,
            policy: pipeline.settings.retry.clone(),
            events: pipeline.events.clone(),
            cancel: cancel.clone(),
            halt: CancelToken::new(),
        };

        Ok(Self {
            pipeline,
            build,
            graph,
            context,
            semaphore: Arc::new(Semaphore::new(pipeline.settings.max_parallel.max(1))),
            active: HashSet::new(),
            retry_queue,
            halt: None,
            tx,
            rx,
        })
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        loop {
            if self.halt.is_none()
                && self
                    .pipeline
                    .cancel_observed(self.build.id, &self.context.cancel)
                    .await?
            {
                tracing::info!(build_id = %self.build.id, in_flight = self.active.len(), "cancellation observed");
                self.stop(Halt::Cancelled);
            }

            if self.halt.is_none() {
                self.dispatch().await?;
            }

            if self.active.is_empty() {
                return Ok(());
            }

            // We hold a sender, so the channel never closes.
            let Some(update) = self.rx.recv().await else {
                return Ok(());
            };
            self.apply(update).await?;
        }
    }

    fn stop(&mut self, halt: Halt) {
        self.context.halt.cancel();
        self.retry_queue.clear();
        self.halt = Some(halt);
    }

    /// Start rounds for queued retries, then newly ready tasks, while
    /// permits last.
    async fn dispatch(&mut self) -> Result<(), PipelineError> {
        let mut candidates: Vec<TaskIndex> = self.retry_queue.iter().copied().collect();
        candidates.extend(ready_tasks(&self.build.plan, &self.graph));

        for index in candidates {
            if self.active.contains(&index) {
                continue;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            self.retry_queue.retain(|&i| i != index);

            let round = self.start_round(index)?;
            self.pipeline.persist(&self.build).await?;

            let context = self.context.clone();
            let tx = self.tx.clone();
            self.active.insert(index);
            tokio::spawn(async move {
                let terminal = AssertUnwindSafe(develop(&context, round, &tx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| TaskUpdate::Failed {
                        index,
                        reason: "development worker panicked".to_string(),
                    });
                // The permit must be free before the owner sees the round end.
                drop(permit);
                tx.send(terminal).await.ok();
            });
        }
        Ok(())
    }

    fn start_round(&mut self, index: TaskIndex) -> Result<Round, PipelineError> {
        let dependencies: Vec<DependencyFile> = self
            .graph
            .dependencies(index)
            .iter()
            .map(|&dep| {
                let task = &self.build.plan.tasks[dep];
                DependencyFile {
                    path: task.path.clone(),
                    content: task.content.clone().unwrap_or_default(),
                }
            })
            .collect();

        let task = &mut self.build.plan.tasks[index];
        task.status = FileStatus::InDevelopment;
        let round = Round {
            index,
            brief: TaskBrief {
                path: task.path.clone(),
                description: task.description.clone(),
                attempt: task.attempt(),
            },
            dependencies,
            feedback: task.rejection_reasons(),
        };

        tracing::info!(
            build_id = %self.build.id,
            path = %round.brief.path,
            attempt = round.brief.attempt,
            "task started"
        );
        self.pipeline.events.emit(BuildEvent::TaskStarted {
            build_id: self.build.id,
            path: round.brief.path.clone(),
            attempt: round.brief.attempt,
        });
        self.pipeline
            .transition(&mut self.build, BuildStatus::Developing)?;
        Ok(round)
    }

    async fn apply(&mut self, update: TaskUpdate) -> Result<(), PipelineError> {
        let halted = self.halt.is_some();
        match update {
            TaskUpdate::Invoked(records) => {
                self.pipeline.record(&mut self.build, records);
            }
            TaskUpdate::Candidate {
                index,
                attempt,
                content,
            } => {
                if halted {
                    return Ok(());
                }
                let build_id = self.build.id;
                let task = &mut self.build.plan.tasks[index];
                task.status = FileStatus::InReview;
                task.content = Some(content);
                let bytes = task.content.as_ref().map_or(0, String::len);
                tracing::debug!(%build_id, path = %task.path, attempt, bytes, "candidate ready for review");
                self.pipeline.events.emit(BuildEvent::TaskCandidate {
                    build_id,
                    path: task.path.clone(),
                    attempt,
                    bytes,
                });
                self.pipeline
                    .transition(&mut self.build, BuildStatus::Reviewing)?;
            }
            TaskUpdate::Reviewed {
                index,
                attempt,
                verdict,
            } => {
                self.active.remove(&index);
                if halted {
                    tracing::debug!(build_id = %self.build.id, index, "discarding verdict after halt");
                    return Ok(());
                }
                self.apply_verdict(index, attempt, verdict)?;
            }
            TaskUpdate::Failed { index, reason } => {
                self.active.remove(&index);
                if halted {
                    return Ok(());
                }
                let build_id = self.build.id;
                let task = &mut self.build.plan.tasks[index];
                task.status = FileStatus::Failed;
                let path = task.path.clone();
                tracing::warn!(%build_id, %path, %reason, "task failed");
                self.pipeline.events.emit(BuildEvent::TaskFailed {
                    build_id,
                    path: path.clone(),
                    reason: reason.clone(),
                });
                self.stop(Halt::Failed {
                    kind: ErrorKind::AgentInvocation,
                    message: format!("agent invocation failed for {}: {}", path, reason),
                    files: vec![FailedFile { path, reason }],
                });
            }
            TaskUpdate::Abandoned { index } => {
                self.active.remove(&index);
            }
        }
        self.pipeline.persist(&self.build).await
    }

    fn apply_verdict(
        &mut self,
        index: TaskIndex,
        attempt: u32,
        verdict: Verdict,
    ) -> Result<(), PipelineError> {
        let build_id = self.build.id;
        let max_retries = self.pipeline.settings.max_review_retries;
        let task = &mut self.build.plan.tasks[index];
        task.reviews.push(ReviewEntry {
            attempt,
            verdict: verdict.clone(),
            at: Utc::now(),
        });

        match verdict {
            Verdict::Approved { .. } => {
                task.status = FileStatus::Approved;
                tracing::info!(%build_id, path = %task.path, attempt, "task approved");
                self.pipeline.events.emit(BuildEvent::TaskApproved {
                    build_id,
                    path: task.path.clone(),
                    attempt,
                });
            }
            Verdict::Rejected { reason } => {
                task.retries += 1;
                self.pipeline.events.emit(BuildEvent::TaskRejected {
                    build_id,
                    path: task.path.clone(),
                    attempt,
                    reason: reason.clone(),
                });
                if task.retries >= max_retries {
                    task.status = FileStatus::Failed;
                    let path = task.path.clone();
                    tracing::warn!(%build_id, %path, retries = task.retries, "review retries exhausted");
                    self.pipeline.events.emit(BuildEvent::TaskFailed {
                        build_id,
                        path: path.clone(),
                        reason: reason.clone(),
                    });
                    self.stop(Halt::Failed {
                        kind: ErrorKind::RetryExhausted,
                        message: format!(
                            "{} rejected {} times; last reason: {}",
                            path, max_retries, reason
                        ),
                        files: vec![FailedFile { path, reason }],
                    });
                } else {
                    task.status = FileStatus::InDevelopment;
                    tracing::info!(%build_id, path = %task.path, retries = task.retries, %reason, "task rejected");
                    self.retry_queue.push_back(index);
                    self.pipeline
                        .transition(&mut self.build, BuildStatus::Developing)?;
                }
            }
        }
        Ok(())
    }

    /// Leave the loop: Publishing, Failed, or Cancelled.
    async fn finish(mut self) -> Result<Build, PipelineError> {
        match self.halt.take() {
            Some(Halt::Cancelled) => self.pipeline.cancel_build(&mut self.build)?,
            Some(Halt::Failed {
                kind,
                message,
                files,
            }) => self
                .pipeline
                .fail_build(&mut self.build, kind, message, files)?,
            None if self.build.plan.all_approved() => self
                .pipeline
                .transition(&mut self.build, BuildStatus::Publishing)?,
            None => {
                let stuck: Vec<&str> = self
                    .build
                    .plan
                    .tasks
                    .iter()
                    .filter(|t| t.status != FileStatus::Approved)
                    .map(|t| t.path.as_str())
                    .collect();
                let defect = format!("no runnable tasks left; unfinished: {}", stuck.join(", "));
                tracing::error!(build_id = %self.build.id, %defect, "invariant violation");
                self.pipeline.fail_build(
                    &mut self.build,
                    ErrorKind::InvariantViolation,
                    defect,
                    Vec::new(),
                )?;
            }
        }
        self.pipeline.commit(self.build).await
    }
}

/// One Coder + Reviewer round. Returns the update that ends the round.
async fn develop(
    context: &WorkerContext,
    round: Round,
    tx: &mpsc::Sender<TaskUpdate>,
) -> TaskUpdate {
    let index = round.index;
    let path = round.brief.path.clone();
    let attempt = round.brief.attempt;

    if context.stopped() {
        return TaskUpdate::Abandoned { index };
    }

    let code_request = CodeRequest {
        specification: context.specification.clone(),
        task: round.brief.clone(),
        dependencies: round.dependencies.clone(),
        feedback: round.feedback,
    };
    let coder = context.agents.coder.clone();
    let invocation = invoke(
        site(context, AgentRole::Coder, &path, attempt),
        || coder.code(&code_request),
    )
    .await;
    tx.send(TaskUpdate::Invoked(invocation.records)).await.ok();
    let content = match invocation.result {
        Ok(artifact) => artifact.content,
        Err(err) => {
            return TaskUpdate::Failed {
                index,
                reason: format!("coder: {}", err),
            };
        }
    };
    tx.send(TaskUpdate::Candidate {
        index,
        attempt,
        content: content.clone(),
    })
    .await
    .ok();

    if context.stopped() {
        return TaskUpdate::Abandoned { index };
    }

    let review_request = ReviewRequest {
        specification: context.specification.clone(),
        task: round.brief,
        content,
        dependencies: round.dependencies,
    };
    let reviewer = context.agents.reviewer.clone();
    let invocation = invoke(
        site(context, AgentRole::Reviewer, &path, attempt),
        || reviewer.review(&review_request),
    )
    .await;
    tx.send(TaskUpdate::Invoked(invocation.records)).await.ok();
    match invocation.result {
        Ok(verdict) => TaskUpdate::Reviewed {
            index,
            attempt,
            verdict,
        },
        Err(err) => TaskUpdate::Failed {
            index,
            reason: format!("reviewer: {}", err),
        },
    }
}

fn site<'a>(
    context: &'a WorkerContext,
    role: AgentRole,
    path: &'a str,
    attempt: u32,
) -> CallSite<'a> {
    CallSite {
        build_id: context.build_id,
        role,
        target: Some(path),
        summary: format!("{} {} (attempt {})", role, path, attempt),
        policy: &context.policy,
        events: &context.events,
    }
}
