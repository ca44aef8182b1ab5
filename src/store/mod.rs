//! Build state persistence.
//!
//! One record per build, replaced atomically on every save. Readers only
//! ever observe committed records. Cancellation requests live beside the
//! record so a save from the driving process never clobbers a request made
//! by another process.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foundry_common::{Build, BuildFilter, BuildId, BuildSummary};

use crate::errors::StoreError;

pub use memory::MemoryBuildStore;
pub use sqlite::SqliteBuildStore;

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn load(&self, id: BuildId) -> Result<Build, StoreError>;

    /// Insert or atomically replace the record for `build.id`.
    async fn save(&self, build: &Build) -> Result<(), StoreError>;

    /// Summaries matching `filter`, newest first.
    async fn list(&self, filter: &BuildFilter) -> Result<Vec<BuildSummary>, StoreError>;

    /// Persist a cancellation request for a build driven elsewhere.
    async fn request_cancel(&self, id: BuildId) -> Result<(), StoreError>;

    async fn cancel_requested(&self, id: BuildId) -> Result<bool, StoreError>;

    /// Remove a build. Returns whether it existed.
    async fn delete(&self, id: BuildId) -> Result<bool, StoreError>;

    /// Delete terminal builds that finished before `cutoff`. Non-terminal
    /// builds are never touched. Returns the deleted ids.
    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildId>, StoreError>;
}
