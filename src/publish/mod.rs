//! Publishing of approved file sets.
//!
//! The orchestrator calls a [`Publisher`] at most once per Publishing
//! transition and never retries it. Adapters make re-publication of the
//! same content harmless.

pub mod directory;
pub mod git;
pub mod github;

use std::sync::Arc;

use async_trait::async_trait;
use foundry_common::{BuildId, PublicationResult, PublishedFile};
use serde::{Deserialize, Serialize};

use crate::config::{FoundryConfig, PublishMode};
use crate::errors::PublishError;
use crate::util::sha256_hex;

pub use directory::DirectoryPublisher;
pub use git::GitPublisher;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedFile {
    pub path: String,
    pub content: String,
}

impl ApprovedFile {
    pub fn digest(&self) -> String {
        sha256_hex(&self.content)
    }
}

/// Everything a publisher needs for one build.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub build_id: BuildId,
    /// Original request text; used for branch names and PR titles.
    pub title: String,
    /// In plan order.
    pub files: Vec<ApprovedFile>,
}

impl PublishRequest {
    pub fn published_files(&self) -> Vec<PublishedFile> {
        self.files
            .iter()
            .map(|f| PublishedFile {
                path: f.path.clone(),
                digest: f.digest(),
            })
            .collect()
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublicationResult, PublishError>;
}

/// Build the publisher selected by `[publish] mode`.
pub fn from_config(config: &FoundryConfig) -> Arc<dyn Publisher> {
    match config.publish_mode() {
        PublishMode::Directory => Arc::new(DirectoryPublisher::new(config.output_dir())),
        PublishMode::Git => Arc::new(GitPublisher::from_config(config)),
    }
}
