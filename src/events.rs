//! Progress events emitted while a build runs.
//!
//! Events are fire-and-forget: the build never waits on a subscriber and a
//! send with no receivers is not an error.

use foundry_common::{AgentRole, BuildId, BuildStatus, ErrorKind};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BuildEvent {
    Submitted {
        build_id: BuildId,
        request: String,
    },
    StatusChanged {
        build_id: BuildId,
        from: BuildStatus,
        to: BuildStatus,
    },
    PlanAccepted {
        build_id: BuildId,
        files: Vec<String>,
    },
    TaskStarted {
        build_id: BuildId,
        path: String,
        attempt: u32,
    },
    TaskCandidate {
        build_id: BuildId,
        path: String,
        attempt: u32,
        bytes: usize,
    },
    TaskRejected {
        build_id: BuildId,
        path: String,
        attempt: u32,
        reason: String,
    },
    TaskApproved {
        build_id: BuildId,
        path: String,
        attempt: u32,
    },
    TaskFailed {
        build_id: BuildId,
        path: String,
        reason: String,
    },
    AgentRetry {
        build_id: BuildId,
        role: AgentRole,
        attempt: u32,
        error: String,
    },
    Published {
        build_id: BuildId,
        reference: String,
    },
    Finished {
        build_id: BuildId,
        status: BuildStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorKind>,
    },
}

impl BuildEvent {
    pub fn build_id(&self) -> BuildId {
        match self {
            Self::Submitted { build_id, .. }
            | Self::StatusChanged { build_id, .. }
            | Self::PlanAccepted { build_id, .. }
            | Self::TaskStarted { build_id, .. }
            | Self::TaskCandidate { build_id, .. }
            | Self::TaskRejected { build_id, .. }
            | Self::TaskApproved { build_id, .. }
            | Self::TaskFailed { build_id, .. }
            | Self::AgentRetry { build_id, .. }
            | Self::Published { build_id, .. }
            | Self::Finished { build_id, .. } => *build_id,
        }
    }
}

/// Cloneable sender side of the event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BuildEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BuildEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
