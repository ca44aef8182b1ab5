//! Cross-process advisory lock per build.
//!
//! One lock file per build under `.foundry/locks/`. The OS lock is released
//! when the guard (and with it the file handle) is dropped, including on a
//! crash, so a stale file on disk never blocks a later driver.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use foundry_common::BuildId;
use fs2::FileExt;

use crate::errors::PipelineError;

pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for BuildLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLock").field("path", &self.path).finish()
    }
}

pub fn lock_path(lock_dir: &Path, id: BuildId) -> PathBuf {
    lock_dir.join(format!("{}.lock", id))
}

/// Take the lock for `id` without blocking.
pub fn try_lock(lock_dir: &Path, id: BuildId) -> Result<BuildLock, PipelineError> {
    let other = |e: io::Error| PipelineError::Other(anyhow::anyhow!("build lock for {}: {}", id, e));
    std::fs::create_dir_all(lock_dir).map_err(other)?;

    let path = lock_path(lock_dir, id);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(other)?;

    // fs2's method, not the std one with the same name.
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            // Holder pid, for humans inspecting the directory.
            file.set_len(0).map_err(other)?;
            write!(file, "{}", std::process::id()).map_err(other)?;
            tracing::debug!(build_id = %id, path = %path.display(), "acquired build lock");
            Ok(BuildLock { _file: file, path })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(PipelineError::Locked { id }),
        Err(e) => Err(other(e)),
    }
}

/// Remove the lock file of a build that no longer exists.
pub fn remove_stale(lock_dir: &Path, id: BuildId) {
    let path = lock_path(lock_dir, id);
    if let Err(e) = std::fs::remove_file(&path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove lock file");
    }
}
