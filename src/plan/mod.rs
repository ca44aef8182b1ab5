//! File Plan validation and scheduling.
//!
//! An Architect's [`PlanDraft`] becomes a [`FilePlan`] only through
//! [`validate`]. After that the dependency graph is fixed; the development
//! loop schedules against it with [`scheduler`].

pub mod graph;
pub mod scheduler;

use std::path::{Component, Path};

use foundry_common::{FilePlan, FileTask};

pub use graph::{FileGraph, TaskIndex};
pub use scheduler::{compute_waves, ready_tasks, wave_of_each};

use crate::agent::PlanDraft;
use crate::errors::PlanError;

/// Check that `path` is a safe relative path inside the output root and
/// return its canonical spelling: the named components joined by `/`, so
/// `./src//lib.rs` and `src/lib.rs` compare equal.
pub fn normalize_path(path: &str) -> Result<String, PlanError> {
    let unsafe_path = |reason: &str| PlanError::UnsafePath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.trim().is_empty() {
        return Err(unsafe_path("empty path"));
    }
    if path.contains('\0') {
        return Err(unsafe_path("contains a NUL byte"));
    }
    if path.starts_with('\\') || path.contains(":\\") {
        return Err(unsafe_path("not a relative path"));
    }
    if path.ends_with('/') {
        return Err(unsafe_path("names a directory"));
    }
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| unsafe_path("not valid UTF-8"))?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(unsafe_path("contains '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path("not a relative path"));
            }
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path("names no file"));
    }
    Ok(parts.join("/"))
}

/// Turn an Architect's draft into a File Plan.
///
/// Rejects empty plans, unsafe paths, duplicate paths, dependencies on
/// files outside the plan, and dependency cycles. Paths and dependency
/// names are normalized first, so two spellings of one file are duplicates.
pub fn validate(draft: PlanDraft) -> Result<(FilePlan, FileGraph), PlanError> {
    if draft.files.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut tasks = Vec::with_capacity(draft.files.len());
    for file in draft.files {
        let path = normalize_path(file.path.trim())?;
        let depends_on = file
            .depends_on
            .iter()
            .map(|dep| {
                // An unsafe dependency can never name a planned file.
                let dep = dep.trim();
                normalize_path(dep).unwrap_or_else(|_| dep.to_string())
            })
            .collect();
        tasks.push(FileTask::new(&path, file.description.trim(), depends_on));
    }

    let graph = FileGraph::build(&tasks)?;
    Ok((FilePlan::new(tasks), graph))
}
