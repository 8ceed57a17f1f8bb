//! Dependency graph for workspace packages
//!
//! Nodes are added in workspace order and never removed, so a node's
//! [`NodeIndex`] doubles as its position in the stable total order used for
//! every tie-break. An edge `A -> B` means A depends on B.

use std::collections::HashMap;
use std::str::FromStr;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GraphError;

use super::cycles::{find_cycles, Cycle};
use super::manifest::{DependencyKind, Package};

/// Specifiers that always point at the local workspace copy
const LOCAL_PROTOCOLS: &[&str] = &["workspace:", "file:", "link:"];

/// Which declared dependency kinds become graph edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKindPolicy {
    /// `dependencies` and `optionalDependencies`
    #[default]
    Dependencies,
    /// Every kind, including `devDependencies` and `peerDependencies`
    All,
}

impl EdgeKindPolicy {
    /// Dependency kinds that produce edges under this policy
    pub fn kinds(&self) -> &'static [DependencyKind] {
        match self {
            Self::Dependencies => &[DependencyKind::Production, DependencyKind::Optional],
            Self::All => &[
                DependencyKind::Production,
                DependencyKind::Optional,
                DependencyKind::Development,
                DependencyKind::Peer,
            ],
        }
    }
}

impl FromStr for EdgeKindPolicy {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dependencies" => Ok(Self::Dependencies),
            "all" => Ok(Self::All),
            other => Err(GraphError::InvalidEdgeKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for EdgeKindPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dependencies => write!(f, "dependencies"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Directed dependency graph over a set of packages
#[derive(Debug, Clone)]
pub struct PackageGraph {
    graph: DiGraph<Package, DependencyKind>,
    index: HashMap<String, NodeIndex>,
    policy: EdgeKindPolicy,
}

impl PackageGraph {
    /// Build the graph over `packages`, keeping their order as the stable order
    pub fn build(packages: &[Package], policy: EdgeKindPolicy) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(packages.len(), packages.len());
        let mut index = HashMap::with_capacity(packages.len());

        for package in packages {
            if index.contains_key(&package.name) {
                return Err(GraphError::DuplicatePackage(package.name.clone()));
            }
            let node = graph.add_node(package.clone());
            index.insert(package.name.clone(), node);
        }

        for package in packages {
            let Some(&from) = index.get(&package.name) else {
                continue;
            };
            for kind in policy.kinds() {
                for (name, range) in package.declared(*kind) {
                    let Some(&to) = index.get(name) else {
                        continue;
                    };
                    if graph.find_edge(from, to).is_some() {
                        continue;
                    }

                    let target: &Package = &graph[to];
                    let satisfied = match range_satisfied(range, &target.version) {
                        Some(satisfied) => satisfied,
                        None => {
                            debug!(
                                package = %package.name,
                                dependency = %name,
                                range = %range,
                                "unrecognised version range, keeping local edge"
                            );
                            true
                        }
                    };
                    if !satisfied {
                        debug!(
                            package = %package.name,
                            dependency = %name,
                            range = %range,
                            local = %target.version,
                            "range excludes local version, not linking"
                        );
                        continue;
                    }

                    graph.add_edge(from, to, *kind);
                }
            }
        }

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            policy = %policy,
            "built package graph"
        );
        Ok(Self {
            graph,
            index,
            policy,
        })
    }

    /// Edge-kind policy the graph was built with
    pub fn policy(&self) -> EdgeKindPolicy {
        self.policy
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph has no packages
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Packages in stable order
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Look up a package by name
    pub fn get(&self, name: &str) -> Option<&Package> {
        self.index.get(name).map(|idx| &self.graph[*idx])
    }

    /// Position of a package in the stable order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|idx| idx.index())
    }

    /// Direct dependencies of `name`, in stable order
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Direct dependents of `name`, in stable order
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Whether `package` has a direct edge to `dependency`
    pub fn depends_on(&self, package: &str, dependency: &str) -> bool {
        match (self.index.get(package), self.index.get(dependency)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// Dependency kind of the edge `package -> dependency`
    pub fn edge_kind(&self, package: &str, dependency: &str) -> Option<DependencyKind> {
        let from = *self.index.get(package)?;
        let to = *self.index.get(dependency)?;
        self.graph.find_edge(from, to).map(|e| self.graph[e])
    }

    /// Cycles under the active policy
    pub fn cycles(&self) -> Vec<Cycle> {
        find_cycles(self)
    }

    pub(crate) fn inner(&self) -> &DiGraph<Package, DependencyKind> {
        &self.graph
    }

    pub(crate) fn name_of(&self, idx: NodeIndex) -> &str {
        &self.graph[idx].name
    }

    /// Drop every edge for which `keep(from, to)` is false
    pub(crate) fn retain_edges(&mut self, mut keep: impl FnMut(NodeIndex, NodeIndex) -> bool) {
        self.graph.retain_edges(|g, e| match g.edge_endpoints(e) {
            Some((from, to)) => keep(from, to),
            None => true,
        });
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        nodes.sort();
        nodes.dedup();
        nodes.into_iter().map(|n| self.name_of(n)).collect()
    }
}

/// Whether `range` accepts the local `version`.
///
/// Local protocols always match. Returns `None` when the range cannot be
/// understood, in which case callers keep the edge.
pub fn range_satisfied(range: &str, version: &str) -> Option<bool> {
    let range = range.trim();
    if LOCAL_PROTOCOLS.iter().any(|p| range.starts_with(p)) {
        return Some(true);
    }
    if range.is_empty() || range == "*" || range.eq_ignore_ascii_case("x") {
        return Some(true);
    }

    let version = Version::parse(version).ok()?;
    let mut matched = false;
    for set in range.split("||") {
        let req = parse_comparator_set(set)?;
        matched |= req.matches(&version);
    }
    Some(matched)
}

/// Translate one npm comparator set into a `VersionReq`
fn parse_comparator_set(set: &str) -> Option<VersionReq> {
    let set = set.trim();
    if set.is_empty() {
        return Some(VersionReq::STAR);
    }

    if let Some((low, high)) = set.split_once(" - ") {
        return VersionReq::parse(&format!(">={}, <={}", low.trim(), high.trim())).ok();
    }

    let mut comparators = Vec::new();
    let mut operator = String::new();
    for token in set.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            operator.push_str(token);
            continue;
        }
        let token = format!("{}{}", std::mem::take(&mut operator), token);
        comparators.push(exact_if_bare(&token));
    }
    if !operator.is_empty() {
        return None;
    }

    VersionReq::parse(&comparators.join(", ")).ok()
}

/// npm reads a bare version as an exact match, `VersionReq` as a caret
fn exact_if_bare(token: &str) -> String {
    let starts_with_digit = token.chars().next().is_some_and(|c| c.is_ascii_digit());
    let core = token.split(['-', '+']).next().unwrap_or(token);
    let wildcard = core.contains(['x', 'X', '*']);
    if starts_with_digit && !wildcard {
        format!("={}", token)
    } else {
        token.to_string()
    }
}
