//! Build orchestration.
//!
//! - [`sequencer`] advances a build one stage step at a time
//! - [`dev_loop`] drives the per-file development/review loop
//! - [`service`] owns running builds and exposes the lifecycle operations
//! - [`lock`] keeps two processes from driving the same build

pub mod dev_loop;
pub mod lock;
pub mod sequencer;
pub mod service;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use foundry_common::{Build, BuildId, BuildStatus};

use crate::agent::AgentTeam;
use crate::config::FoundryConfig;
use crate::errors::PipelineError;
use crate::events::{BuildEvent, EventBus};
use crate::publish::Publisher;
use crate::retry::RetryPolicy;
use crate::store::BuildStore;

pub use service::{BuildService, BuildStatusReport, FileReport};

/// Cooperative cancellation flag shared between a driver and its callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_parallel: usize,
    pub max_review_retries: u32,
    /// Backoff for agent calls.
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_review_retries: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &FoundryConfig) -> Self {
        Self {
            max_parallel: config.max_parallel(),
            max_review_retries: config.max_review_retries(),
            retry: config.retry_policy(),
        }
    }
}

/// Everything a build driver needs. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn BuildStore>,
    pub agents: AgentTeam,
    pub publisher: Arc<dyn Publisher>,
    pub events: EventBus,
    pub settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn BuildStore>,
        agents: AgentTeam,
        publisher: Arc<dyn Publisher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            agents,
            publisher,
            events: EventBus::default(),
            settings,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Whether the build should stop: the in-process token or a request
    /// persisted by another process.
    pub(crate) async fn cancel_observed(
        &self,
        id: BuildId,
        cancel: &CancelToken,
    ) -> Result<bool, PipelineError> {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        Ok(self.store.cancel_requested(id).await?)
    }

    /// Move `build` to `next` and announce it. Not persisted.
    pub(crate) fn transition(
        &self,
        build: &mut Build,
        next: BuildStatus,
    ) -> Result<(), PipelineError> {
        let from = build.status;
        if from == next {
            return Ok(());
        }
        build.transition(next)?;
        tracing::info!(build_id = %build.id, %from, to = %next, stage = %build.stage, "status changed");
        self.events.emit(BuildEvent::StatusChanged {
            build_id: build.id,
            from,
            to: next,
        });
        Ok(())
    }
}
