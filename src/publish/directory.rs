//! Publishes approved files to `<output_dir>/<build_id>/`.
//!
//! A `foundry-manifest.json` beside the files records their digests.
//! Publishing content whose digests already match the manifest writes
//! nothing and returns the recorded result.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use foundry_common::{BuildId, PublicationResult, PublishedFile};
use serde::{Deserialize, Serialize};

use super::{PublishRequest, Publisher};
use crate::errors::PublishError;
use crate::plan::normalize_path;

pub const MANIFEST_FILE: &str = "foundry-manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    build_id: BuildId,
    request: String,
    files: Vec<PublishedFile>,
    published_at: chrono::DateTime<Utc>,
}

pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn build_dir(&self, id: BuildId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn result(dir: &Path, manifest: &Manifest) -> PublicationResult {
        PublicationResult {
            reference: dir.display().to_string(),
            branch: None,
            commit: None,
            url: None,
            files: manifest.files.clone(),
            published_at: manifest.published_at,
        }
    }

    async fn read_manifest(dir: &Path) -> Option<Manifest> {
        let raw = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), PublishError> {
        let io = |source: std::io::Error| PublishError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let tmp = path.with_extension("foundry-tmp");
        tokio::fs::write(&tmp, content).await.map_err(io)?;
        tokio::fs::rename(&tmp, path).await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublicationResult, PublishError> {
        for file in &request.files {
            normalize_path(&file.path).map_err(|_| PublishError::UnsafePath(file.path.clone()))?;
        }

        let dir = self.build_dir(request.build_id);
        let files = request.published_files();

        if let Some(existing) = Self::read_manifest(&dir).await
            && existing.files == files
        {
            tracing::info!(build_id = %request.build_id, dir = %dir.display(), "already published, skipping");
            return Ok(Self::result(&dir, &existing));
        }

        for file in &request.files {
            Self::write_atomic(&dir.join(&file.path), file.content.as_bytes()).await?;
        }

        let manifest = Manifest {
            build_id: request.build_id,
            request: request.title.clone(),
            files,
            published_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| PublishError::Other(anyhow::anyhow!("serializing manifest: {}", e)))?;
        Self::write_atomic(&dir.join(MANIFEST_FILE), &json).await?;

        tracing::info!(
            build_id = %request.build_id,
            dir = %dir.display(),
            files = request.files.len(),
            "published to directory"
        );
        Ok(Self::result(&dir, &manifest))
    }
}
