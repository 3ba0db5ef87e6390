use super::task::Dispatch;
use crate::types::TaskId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;

/// Dependency graph of one task group.
///
/// Nodes are the group's members, in member order, so a node index equals
/// the member's position. Edges point from dependency to dependent and only
/// exist between members; dependencies outside the group are checked through
/// readiness alone.
pub(crate) struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    /// Unsettled in-group dependencies per member
    in_degree: Vec<usize>,
    /// Members already handed to the ready queue
    released: Vec<bool>,
}

impl DependencyGraph {
    pub(crate) fn build(tasks: &[Arc<dyn Dispatch>]) -> Self {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut indices = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let node = graph.add_node(task.id().clone());
            indices.insert(task.id().clone(), node);
        }

        let mut in_degree = vec![0; tasks.len()];
        for (position, task) in tasks.iter().enumerate() {
            for dependency in task.dependencies() {
                if let Some(&dep_idx) = indices.get(dependency.id()) {
                    graph.add_edge(dep_idx, NodeIndex::new(position), ());
                    if !dependency.is_done() {
                        in_degree[position] += 1;
                    }
                }
            }
        }

        // Members settled by an earlier run are never dispatched again
        let released = tasks.iter().map(|t| t.is_done()).collect();

        Self {
            graph,
            in_degree,
            released,
        }
    }

    /// Members with no unsettled in-group dependency, in member order.
    /// Each is returned at most once.
    pub(crate) fn take_entry_points(&mut self) -> Vec<usize> {
        let mut entry_points = Vec::new();
        for position in 0..self.in_degree.len() {
            if self.in_degree[position] == 0 && self.release(position) {
                entry_points.push(position);
            }
        }
        entry_points
    }

    /// Record that `position` settled and return the dependents that should
    /// now be checked.
    ///
    /// A successful settle releases dependents whose last dependency this
    /// was. A faulted settle releases every dependent at once, so their
    /// readiness check can raise the fault.
    pub(crate) fn settle(&mut self, position: usize, faulted: bool) -> Vec<usize> {
        let dependents: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(position), Direction::Outgoing)
            .map(|n| n.index())
            .collect();

        let mut ready = Vec::new();
        for dependent in dependents.into_iter().rev() {
            self.in_degree[dependent] = self.in_degree[dependent].saturating_sub(1);
            if (faulted || self.in_degree[dependent] == 0) && self.release(dependent) {
                ready.push(dependent);
            }
        }
        ready
    }

    /// Members never handed to the ready queue
    pub(crate) fn unreleased(&self) -> impl Iterator<Item = usize> + '_ {
        self.released
            .iter()
            .enumerate()
            .filter(|(_, released)| !**released)
            .map(|(i, _)| i)
    }

    /// Whether the in-group dependencies form a cycle
    pub(crate) fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    fn release(&mut self, position: usize) -> bool {
        if self.released[position] {
            false
        } else {
            self.released[position] = true;
            true
        }
    }
}
