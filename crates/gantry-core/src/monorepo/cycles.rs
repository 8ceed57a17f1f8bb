//! Dependency cycle detection and resolution

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GraphError;

use super::graph::PackageGraph;

/// A dependency cycle, stored as the walk `a -> b -> ... -> a` without the
/// closing repeat of its first package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    path: Vec<String>,
}

impl Cycle {
    /// Create a cycle from its walk
    pub fn new(path: Vec<String>) -> Self {
        Self { path }
    }

    /// Packages on the cycle in walk order
    pub fn packages(&self) -> &[String] {
        &self.path
    }

    /// Whether the cycle is a package depending on itself
    pub fn is_self_loop(&self) -> bool {
        self.path.len() == 1
    }
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for name in &self.path {
            write!(f, "{} -> ", name)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

/// What to do when the graph has cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CyclePolicy {
    /// Fail the run before anything is published
    Reject,
    /// Ignore the edges that close each cycle and continue with a warning
    #[default]
    WarnAndLinearize,
}

impl FromStr for CyclePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "warn" | "warn-and-linearize" => Ok(Self::WarnAndLinearize),
            other => Err(format!(
                "invalid cycle policy '{}', expected 'reject' or 'warn-and-linearize'",
                other
            )),
        }
    }
}

/// Find every cycle in `graph`.
///
/// One cycle is reported per strongly connected component with more than one
/// package, plus one for each self-dependency. Cycles are ordered by their
/// first package in the graph's stable order, and each walk starts at the
/// component's earliest package.
pub fn find_cycles(graph: &PackageGraph) -> Vec<Cycle> {
    let inner = graph.inner();
    let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(inner)
        .into_iter()
        .filter(|scc| scc.len() > 1 || inner.find_edge(scc[0], scc[0]).is_some())
        .map(|mut scc| {
            scc.sort();
            scc
        })
        .collect();
    components.sort();

    components
        .iter()
        .map(|scc| {
            let walk = shortest_cycle(graph, scc);
            Cycle::new(walk.into_iter().map(|n| graph.name_of(n).to_string()).collect())
        })
        .collect()
}

/// Shortest walk from the component's first node back to itself
fn shortest_cycle(graph: &PackageGraph, scc: &[NodeIndex]) -> Vec<NodeIndex> {
    let inner = graph.inner();
    let start = scc[0];
    if scc.len() == 1 {
        return vec![start];
    }

    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = inner
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort();

        for neighbor in next {
            if neighbor == start {
                let mut walk = vec![node];
                let mut current = node;
                while let Some(&prev) = parent.get(&current) {
                    walk.push(prev);
                    current = prev;
                }
                walk.reverse();
                return walk;
            }
            if !parent.contains_key(&neighbor) {
                parent.insert(neighbor, node);
                queue.push_back(neighbor);
            }
        }
    }

    scc.to_vec()
}

/// Back edges of a depth-first walk over one strongly connected component
fn back_edges(graph: &PackageGraph, mut scc: Vec<NodeIndex>) -> Vec<(NodeIndex, NodeIndex)> {
    let inner = graph.inner();
    if scc.len() == 1 && inner.find_edge(scc[0], scc[0]).is_none() {
        return Vec::new();
    }
    scc.sort();

    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let successors = |node: NodeIndex| -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = inner
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort();
        next.dedup();
        next
    };

    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut on_stack: HashSet<NodeIndex> = HashSet::new();
    let mut back = Vec::new();

    for &root in &scc {
        if !visited.insert(root) {
            continue;
        }
        on_stack.insert(root);
        let mut stack = vec![(root, successors(root), 0usize)];

        while let Some((node, next, cursor)) = stack.last_mut() {
            let node = *node;
            let Some(&target) = next.get(*cursor) else {
                on_stack.remove(&node);
                stack.pop();
                continue;
            };
            *cursor += 1;

            if on_stack.contains(&target) {
                back.push((node, target));
            } else if visited.insert(target) {
                on_stack.insert(target);
                stack.push((target, successors(target), 0));
            }
        }
    }

    back
}

/// Outcome of cycle resolution
#[derive(Debug, Clone)]
pub struct CycleResolution {
    /// Graph with every cycle broken
    pub graph: PackageGraph,
    /// Cycles found in the input graph
    pub cycles: Vec<Cycle>,
    /// Edges that were ignored to break them, as `(package, dependency)`
    pub ignored_edges: Vec<(String, String)>,
}

/// Applies a [`CyclePolicy`] to a package graph
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleResolver {
    policy: CyclePolicy,
}

impl CycleResolver {
    /// Create a resolver for `policy`
    pub fn new(policy: CyclePolicy) -> Self {
        Self { policy }
    }

    /// Produce an acyclic graph or fail under the reject policy.
    ///
    /// Linearizing drops only the edges that close a cycle: the back edges of
    /// a depth-first walk over each cycle's component, started at its earliest
    /// package with dependencies visited in stable order. Self edges are back
    /// edges too. Every other dependency inside the component is kept.
    pub fn resolve(&self, mut graph: PackageGraph) -> Result<CycleResolution, GraphError> {
        let cycles = find_cycles(&graph);
        if cycles.is_empty() {
            return Ok(CycleResolution {
                graph,
                cycles,
                ignored_edges: Vec::new(),
            });
        }

        if self.policy == CyclePolicy::Reject {
            return Err(GraphError::Cycles { cycles });
        }

        let mut removed: Vec<(NodeIndex, NodeIndex)> = tarjan_scc(graph.inner())
            .into_iter()
            .flat_map(|scc| back_edges(&graph, scc))
            .collect();
        removed.sort();
        removed.dedup();

        let dropped: HashSet<(NodeIndex, NodeIndex)> = removed.iter().copied().collect();
        graph.retain_edges(|from, to| !dropped.contains(&(from, to)));

        let ignored_edges: Vec<(String, String)> = removed
            .into_iter()
            .map(|(from, to)| (graph.name_of(from).to_string(), graph.name_of(to).to_string()))
            .collect();

        let mut affected: Vec<&str> = cycles
            .iter()
            .flat_map(|c| c.packages().iter().map(String::as_str))
            .collect();
        affected.sort();
        affected.dedup();

        warn!(
            cycles = cycles.len(),
            packages = %affected.join(", "),
            "Dependency cycles detected, you should fix these!"
        );
        for cycle in &cycles {
            warn!(cycle = %cycle, "ignoring dependency cycle");
        }

        Ok(CycleResolution {
            graph,
            cycles,
            ignored_edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monorepo::graph::tests::pkg;
    use crate::monorepo::graph::EdgeKindPolicy;
    use crate::monorepo::schedule::PublishScheduler;

    fn cyclic() -> PackageGraph {
        let packages = vec![
            pkg("a", "1.0.0", &[("dependencies", "c", "^1.0.0")]),
            pkg("b", "1.0.0", &[("dependencies", "a", "^1.0.0")]),
            pkg("c", "1.0.0", &[("dependencies", "b", "^1.0.0")]),
            pkg("d", "1.0.0", &[("dependencies", "a", "^1.0.0")]),
        ];
        PackageGraph::build(&packages, EdgeKindPolicy::Dependencies).unwrap()
    }

    #[test]
    fn test_acyclic_graph_has_no_cycles() {
        let packages = vec![
            pkg("a", "1.0.0", &[]),
            pkg("b", "1.0.0", &[("dependencies", "a", "^1.0.0")]),
        ];
        let graph = PackageGraph::build(&packages, EdgeKindPolicy::Dependencies).unwrap();
        assert!(find_cycles(&graph).is_empty());

        let resolution = CycleResolver::default().resolve(graph).unwrap();
        assert!(resolution.ignored_edges.is_empty());
        assert_eq!(resolution.graph.edge_count(), 1);
    }

    #[test]
    fn test_find_cycle_walk() {
        let cycles = find_cycles(&cyclic());
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].packages(), &["a", "c", "b"]);
        assert_eq!(cycles[0].to_string(), "a -> c -> b -> a");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let packages = vec![
            pkg("a", "1.0.0", &[("dependencies", "a", "^1.0.0")]),
            pkg("b", "1.0.0", &[]),
        ];
        let graph = PackageGraph::build(&packages, EdgeKindPolicy::Dependencies).unwrap();
        let cycles = find_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].is_self_loop());
        assert_eq!(cycles[0].to_string(), "a -> a");

        let resolution = CycleResolver::default().resolve(graph).unwrap();
        assert_eq!(resolution.ignored_edges, vec![("a".to_string(), "a".to_string())]);
        assert!(find_cycles(&resolution.graph).is_empty());
    }

    #[test]
    fn test_overlapping_cycles_share_a_component() {
        let packages = vec![
            pkg("a", "1.0.0", &[("dependencies", "b", "^1.0.0")]),
            pkg(
                "b",
                "1.0.0",
                &[("dependencies", "a", "^1.0.0"), ("dependencies", "c", "^1.0.0")],
            ),
            pkg("c", "1.0.0", &[("dependencies", "b", "^1.0.0")]),
            pkg("x", "1.0.0", &[("dependencies", "y", "^1.0.0")]),
            pkg("y", "1.0.0", &[("dependencies", "x", "^1.0.0")]),
        ];
        let graph = PackageGraph::build(&packages, EdgeKindPolicy::Dependencies).unwrap();
        let cycles = find_cycles(&graph);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].to_string(), "a -> b -> a");
        assert_eq!(cycles[1].to_string(), "x -> y -> x");
    }

    #[test]
    fn test_reject_policy_fails() {
        let err = CycleResolver::new(CyclePolicy::Reject)
            .resolve(cyclic())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Dependency cycles detected, you should fix these!"));
        assert!(message.contains("cycle"));
        assert!(message.contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_linearize_drops_only_the_closing_edge() {
        let resolution = CycleResolver::default().resolve(cyclic()).unwrap();

        assert_eq!(resolution.cycles.len(), 1);
        assert_eq!(
            resolution.ignored_edges,
            vec![("b".to_string(), "a".to_string())]
        );
        assert!(resolution.graph.depends_on("a", "c"));
        assert!(resolution.graph.depends_on("c", "b"));
        assert!(resolution.graph.depends_on("d", "a"));
        assert!(find_cycles(&resolution.graph).is_empty());
    }

    #[test]
    fn test_linearized_walk_order_is_publish_order() {
        let resolution = CycleResolver::default().resolve(cyclic()).unwrap();
        let plan = PublishScheduler::schedule(&resolution.graph).unwrap();

        assert_eq!(
            plan.batches().to_vec(),
            vec![
                vec!["b".to_string()],
                vec!["c".to_string()],
                vec!["a".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn test_overlapping_cycles_keep_forward_edges() {
        let packages = vec![
            pkg("a", "1.0.0", &[("dependencies", "b", "^1.0.0")]),
            pkg(
                "b",
                "1.0.0",
                &[("dependencies", "a", "^1.0.0"), ("dependencies", "c", "^1.0.0")],
            ),
            pkg("c", "1.0.0", &[("dependencies", "b", "^1.0.0")]),
        ];
        let graph = PackageGraph::build(&packages, EdgeKindPolicy::Dependencies).unwrap();
        let resolution = CycleResolver::default().resolve(graph).unwrap();

        assert_eq!(
            resolution.ignored_edges,
            vec![
                ("b".to_string(), "a".to_string()),
                ("c".to_string(), "b".to_string()),
            ]
        );
        assert!(resolution.graph.depends_on("a", "b"));
        assert!(resolution.graph.depends_on("b", "c"));
        assert!(find_cycles(&resolution.graph).is_empty());
    }

    #[test]
    fn test_cycle_policy_parse() {
        assert_eq!("reject".parse::<CyclePolicy>().unwrap(), CyclePolicy::Reject);
        assert_eq!(
            "warn-and-linearize".parse::<CyclePolicy>().unwrap(),
            CyclePolicy::WarnAndLinearize
        );
        assert!("nope".parse::<CyclePolicy>().is_err());
    }
}
