//! In-process store for tests and ephemeral runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foundry_common::{Build, BuildFilter, BuildId, BuildSummary};
use tokio::sync::RwLock;

use super::BuildStore;
use crate::errors::StoreError;

#[derive(Default)]
pub struct MemoryBuildStore {
    builds: RwLock<HashMap<BuildId, Build>>,
    cancel_requests: RwLock<HashSet<BuildId>>,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn load(&self, id: BuildId) -> Result<Build, StoreError> {
        self.builds
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, build: &Build) -> Result<(), StoreError> {
        self.builds.write().await.insert(build.id, build.clone());
        Ok(())
    }

    async fn list(&self, filter: &BuildFilter) -> Result<Vec<BuildSummary>, StoreError> {
        let builds = self.builds.read().await;
        let mut summaries: Vec<BuildSummary> = builds
            .values()
            .map(Build::summary)
            .filter(|s| filter.matches(s))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    async fn request_cancel(&self, id: BuildId) -> Result<(), StoreError> {
        if !self.builds.read().await.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.cancel_requests.write().await.insert(id);
        Ok(())
    }

    async fn cancel_requested(&self, id: BuildId) -> Result<bool, StoreError> {
        Ok(self.cancel_requests.read().await.contains(&id))
    }

    async fn delete(&self, id: BuildId) -> Result<bool, StoreError> {
        self.cancel_requests.write().await.remove(&id);
        Ok(self.builds.write().await.remove(&id).is_some())
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildId>, StoreError> {
        let mut builds = self.builds.write().await;
        let mut expired: Vec<(DateTime<Utc>, BuildId)> = builds
            .values()
            .filter(|b| b.is_terminal())
            .filter_map(|b| b.finished_at.filter(|t| *t < cutoff).map(|t| (t, b.id)))
            .collect();
        expired.sort();

        let mut cancels = self.cancel_requests.write().await;
        let ids: Vec<BuildId> = expired.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            builds.remove(id);
            cancels.remove(id);
        }
        Ok(ids)
    }
}
