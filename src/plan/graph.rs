//! Dependency graph over the files of a plan.
//!
//! Built once from a plan's tasks. Construction validates the graph
//! structure: every dependency must name a file in the plan, paths are
//! unique, and there are no cycles.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use foundry_common::FileTask;

use crate::errors::PlanError;

/// Index into the plan's task list.
pub type TaskIndex = usize;

#[derive(Debug)]
pub struct FileGraph {
    paths: Vec<String>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
    /// Topological order, ties broken by plan order.
    order: Vec<TaskIndex>,
}

impl FileGraph {
    pub fn build(tasks: &[FileTask]) -> Result<Self, PlanError> {
        let mut index_map = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index_map.insert(task.path.clone(), i).is_some() {
                return Err(PlanError::DuplicatePath(task.path.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];

        for (to, task) in tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                let from = *index_map
                    .get(dep)
                    .ok_or_else(|| PlanError::UnknownDependency {
                        path: task.path.clone(),
                        dependency: dep.clone(),
                    })?;
                if seen.insert(from) {
                    forward_edges[from].push(to);
                    reverse_edges[to].push(from);
                }
            }
        }

        let mut graph = Self {
            paths: tasks.iter().map(|t| t.path.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
            order: Vec::new(),
        };
        graph.order = graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn path(&self, index: TaskIndex) -> Option<&str> {
        self.paths.get(index).map(String::as_str)
    }

    pub fn index_of(&self, path: &str) -> Option<TaskIndex> {
        self.index_map.get(path).copied()
    }

    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Indices in dependency order; among tasks that become ready together,
    /// the one listed first in the plan comes first.
    pub fn order(&self) -> &[TaskIndex] {
        &self.order
    }

    pub fn ordered_paths(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.paths[i].as_str()).collect()
    }

    // Kahn's algorithm with a min-heap so ties resolve to plan order.
    fn topological_order(&self) -> Result<Vec<TaskIndex>, PlanError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut heap: BinaryHeap<Reverse<TaskIndex>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = heap.pop() {
            order.push(node);
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    heap.push(Reverse(dependent));
                }
            }
        }

        if order.len() != self.len() {
            // Unsorted tasks are on a cycle or downstream of one; only the
            // former are reported.
            let unsorted: Vec<bool> = in_degree.iter().map(|&deg| deg > 0).collect();
            let cycle: Vec<String> = (0..self.len())
                .filter(|&i| unsorted[i] && self.reaches_itself(i, &unsorted))
                .map(|i| self.paths[i].clone())
                .collect();
            return Err(PlanError::Cycle(cycle));
        }
        Ok(order)
    }

    /// Whether `start` can reach itself through dependents within `within`.
    fn reaches_itself(&self, start: TaskIndex, within: &[bool]) -> bool {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<TaskIndex> = self.dependents(start).to_vec();
        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if !within[node] || seen[node] {
                continue;
            }
            seen[node] = true;
            stack.extend_from_slice(self.dependents(node));
        }
        false
    }
}
