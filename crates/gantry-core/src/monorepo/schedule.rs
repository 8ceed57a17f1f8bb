//! Batch scheduling for publishes

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GraphError;

use super::graph::PackageGraph;

/// Ordered publish batches; packages within a batch may publish concurrently
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPlan {
    batches: Vec<Vec<String>>,
}

impl PublishPlan {
    /// Plan from precomputed batches
    pub fn new(batches: Vec<Vec<String>>) -> Self {
        Self { batches }
    }

    /// Batches in publish order
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Total number of packages
    pub fn total(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Whether the plan publishes nothing
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Index of the batch containing `name`
    pub fn batch_of(&self, name: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|n| n == name))
    }

    /// Every package in publish order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flatten().map(String::as_str)
    }
}

/// Kahn layering over an acyclic package graph
pub struct PublishScheduler;

impl PublishScheduler {
    /// Layer `graph` into batches.
    ///
    /// Batch 0 holds every package without dependencies. Each following batch
    /// holds the packages whose last dependency was in the previous one.
    /// Packages inside a batch keep the graph's stable order.
    pub fn schedule(graph: &PackageGraph) -> Result<PublishPlan, GraphError> {
        let inner = graph.inner();
        let mut pending: Vec<usize> = inner
            .node_indices()
            .map(|n| inner.edges_directed(n, Direction::Outgoing).count())
            .collect();

        let mut current: Vec<NodeIndex> = inner
            .node_indices()
            .filter(|n| pending[n.index()] == 0)
            .collect();
        let mut scheduled = 0;
        let mut batches = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for edge in inner.edges_directed(node, Direction::Incoming) {
                    let dependent = edge.source();
                    pending[dependent.index()] -= 1;
                    if pending[dependent.index()] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort();

            scheduled += current.len();
            batches.push(
                current
                    .iter()
                    .map(|n| graph.name_of(*n).to_string())
                    .collect(),
            );
            current = next;
        }

        if scheduled != graph.len() {
            let stuck: Vec<String> = inner
                .node_indices()
                .filter(|n| pending[n.index()] > 0)
                .map(|n| graph.name_of(n).to_string())
                .collect();
            return Err(GraphError::Unschedulable(stuck));
        }

        debug!(batches = batches.len(), packages = scheduled, "scheduled publish batches");
        Ok(PublishPlan { batches })
    }
}
