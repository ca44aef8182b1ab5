//! Ready-set computation for the development loop.

use foundry_common::{FilePlan, FileStatus};

use super::graph::{FileGraph, TaskIndex};

/// Whether every dependency of `index` is Approved.
pub fn dependencies_approved(plan: &FilePlan, graph: &FileGraph, index: TaskIndex) -> bool {
    graph
        .dependencies(index)
        .iter()
        .all(|&dep| plan.tasks[dep].status == FileStatus::Approved)
}

/// Pending tasks whose dependencies are all Approved, in topological order
/// (ties by plan order).
pub fn ready_tasks(plan: &FilePlan, graph: &FileGraph) -> Vec<TaskIndex> {
    graph
        .order()
        .iter()
        .copied()
        .filter(|&i| plan.tasks[i].status == FileStatus::Pending)
        .filter(|&i| dependencies_approved(plan, graph, i))
        .collect()
}

/// Group tasks into waves: wave 0 has no dependencies, wave N depends only
/// on earlier waves. Used for display.
pub fn compute_waves(graph: &FileGraph) -> Vec<Vec<TaskIndex>> {
    let mut depth = vec![0usize; graph.len()];
    for &i in graph.order() {
        depth[i] = graph
            .dependencies(i)
            .iter()
            .map(|&d| depth[d] + 1)
            .max()
            .unwrap_or(0);
    }

    let max = depth.iter().copied().max().unwrap_or(0);
    let mut waves = vec![Vec::new(); if graph.is_empty() { 0 } else { max + 1 }];
    for &i in graph.order() {
        waves[depth[i]].push(i);
    }
    waves
}

/// Wave number of each task, indexed like the plan.
pub fn wave_of_each(graph: &FileGraph) -> Vec<usize> {
    let mut out = vec![0; graph.len()];
    for (wave, members) in compute_waves(graph).into_iter().enumerate() {
        for i in members {
            out[i] = wave;
        }
    }
    out
}
