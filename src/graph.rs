//! Dependency Graph - collections and the references between them
//!
//! Nodes are collection names; an edge `A -> B` means A depends on B and
//! must be saved after it. Edges are tagged with the attribute that carries
//! the reference, so several edges may join the same pair of nodes.
//!
//! Cycles are broken by removing the edges of one node pair on the cycle and
//! deferring the attributes backing them to a post-save pass.

use crate::collection::CollectionSet;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Why one collection depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// A record attribute holds a dependency reference
    Attribute,
    /// An identity (manager_ref) attribute holds the reference; the record
    /// cannot be keyed without it, so it is never deferrable
    Identity,
    /// Targeted refresh of a descendant; never deferrable
    Ancestor,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Attribute => "attribute",
            EdgeKind::Identity => "identity",
            EdgeKind::Ancestor => "ancestor",
        }
    }

    /// Check if breaking this edge can be compensated by a deferred pass
    pub fn is_deferrable(&self) -> bool {
        matches!(self, EdgeKind::Attribute)
    }
}

/// A single attribute-tagged dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    pub attribute: Option<String>,
}

impl DependencyEdge {
    pub fn attribute(from: impl Into<String>, to: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Attribute,
            attribute: Some(attribute.into()),
        }
    }

    pub fn identity(from: impl Into<String>, to: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            kind: EdgeKind::Identity,
            ..Self::attribute(from, to, attribute)
        }
    }

    pub fn ancestor(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Ancestor,
            attribute: None,
        }
    }
}

impl std::fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{} -[{}]-> {}", self.from, attr, self.to),
            None => write!(f, "{} -[{}]-> {}", self.from, self.kind.as_str(), self.to),
        }
    }
}

/// Edges removed to break a cycle, with the attributes that must be deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackEdge {
    pub from: String,
    pub to: String,
    pub attributes: BTreeSet<String>,
}

/// Dependency multigraph over collection names.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: BTreeSet<DependencyEdge>,
    assert_integrity: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

impl DependencyGraph {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            edges: BTreeSet::new(),
            assert_integrity: false,
        }
    }

    /// Reject edges naming collections that are not nodes
    pub fn with_integrity_assertions(mut self, enabled: bool) -> Self {
        self.assert_integrity = enabled;
        self
    }

    /// Build the graph from scanned collections
    pub fn from_collections(collections: &CollectionSet, assert_integrity: bool) -> Result<Self> {
        let mut graph = Self::new(collections.names()).with_integrity_assertions(assert_integrity);
        for collection in collections.iter() {
            for (attr, targets) in collection.dependency_attributes() {
                let identity = collection.manager_ref().contains(attr);
                for target in targets {
                    let edge = if identity {
                        DependencyEdge::identity(collection.name(), target, attr)
                    } else {
                        DependencyEdge::attribute(collection.name(), target, attr)
                    };
                    graph.add_edge(edge)?;
                }
            }
            for ancestor in &collection.ancestor_dependencies {
                graph.add_edge(DependencyEdge::ancestor(collection.name(), ancestor))?;
            }
        }
        Ok(graph)
    }

    pub fn add_edge(&mut self, edge: DependencyEdge) -> Result<()> {
        if edge.kind != EdgeKind::Ancestor && edge.attribute.as_deref().is_none_or(|a| a.trim().is_empty()) {
            return Err(Error::Config(format!(
                "Dependency {} -> {} has no attribute",
                edge.from, edge.to
            )));
        }
        let unknown: Vec<&str> = [&edge.from, &edge.to]
            .into_iter()
            .filter(|n| !self.nodes.contains(*n))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            if self.assert_integrity {
                return Err(Error::Config(format!(
                    "Dependency {} names unknown collections: {}",
                    edge,
                    unknown.join(", ")
                )));
            }
            warn!(edge = %edge, "Dropping dependency on unknown collection");
            return Ok(());
        }
        self.edges.insert(edge);
        Ok(())
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter()
    }

    fn adjacency(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> =
            self.nodes.iter().map(|n| (n.as_str(), BTreeSet::new())).collect();
        for edge in &self.edges {
            adjacency.entry(edge.from.as_str()).or_default().insert(edge.to.as_str());
        }
        adjacency
    }

    /// Find one cycle, returned as a closed path `[a, b, ..., a]`.
    ///
    /// Iterative DFS with an on-stack marker; nodes and neighbours are
    /// visited in lexical order so the same graph yields the same cycle.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let adjacency = self.adjacency();
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for &start in adjacency.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut stack: Vec<(&str, Vec<&str>, usize)> = Vec::new();
            marks.insert(start, Mark::OnStack);
            stack.push((start, adjacency[start].iter().copied().collect(), 0));

            while let Some((node, neighbours, next)) = stack.last_mut() {
                if let Some(&neighbour) = neighbours.get(*next) {
                    *next += 1;
                    match marks.get(neighbour) {
                        Some(Mark::OnStack) => {
                            let position = stack.iter().position(|(n, _, _)| *n == neighbour).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                stack[position..].iter().map(|(n, _, _)| n.to_string()).collect();
                            cycle.push(neighbour.to_string());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(neighbour, Mark::OnStack);
                            let following = adjacency
                                .get(neighbour)
                                .map(|n| n.iter().copied().collect())
                                .unwrap_or_default();
                            stack.push((neighbour, following, 0));
                        }
                    }
                } else {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }
        None
    }

    /// Break every cycle, producing an acyclic graph plus feedback edges.
    ///
    /// On each detected cycle the node pair with the fewest distinct backing
    /// attributes is cut, ties going to the lexically smallest `(from, to)`.
    /// Pairs joined by an ancestor or identity edge are never cut; a cycle
    /// made only of such pairs is an error.
    pub fn resolve_cycles(mut self) -> Result<ResolvedGraph> {
        let mut feedback = Vec::new();

        while let Some(cycle) = self.find_cycle() {
            let mut best: Option<(usize, &str, &str)> = None;
            for pair in cycle.windows(2) {
                let (from, to) = (pair[0].as_str(), pair[1].as_str());
                let pair_edges: Vec<&DependencyEdge> =
                    self.edges.iter().filter(|e| e.from == from && e.to == to).collect();
                if pair_edges.iter().any(|e| !e.kind.is_deferrable()) {
                    continue;
                }
                let attributes: BTreeSet<&str> = pair_edges.iter().filter_map(|e| e.attribute.as_deref()).collect();
                let candidate = (attributes.len(), from, to);
                if best.is_none_or(|current| candidate < current) {
                    best = Some(candidate);
                }
            }

            let Some((_, from, to)) = best else {
                return Err(Error::UnresolvableCycle(cycle));
            };
            let (from, to) = (from.to_string(), to.to_string());

            let removed: Vec<DependencyEdge> =
                self.edges.iter().filter(|e| e.from == from && e.to == to).cloned().collect();
            let attributes: BTreeSet<String> = removed.iter().filter_map(|e| e.attribute.clone()).collect();
            for edge in &removed {
                self.edges.remove(edge);
            }
            debug!(from = %from, to = %to, attributes = ?attributes, "Deferring cycle edge");
            feedback.push(FeedbackEdge { from, to, attributes });
        }

        Ok(ResolvedGraph {
            nodes: self.nodes,
            edges: self.edges,
            feedback,
        })
    }
}

/// Acyclic dependency graph plus the edges removed to make it so.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedGraph {
    pub nodes: BTreeSet<String>,
    pub edges: BTreeSet<DependencyEdge>,
    pub feedback: Vec<FeedbackEdge>,
}

impl ResolvedGraph {
    /// Collections `node` must be saved after
    pub fn dependencies_of(&self, node: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == node && e.to != node)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Attributes of `collection` postponed to the deferred pass
    pub fn deferred_attributes(&self, collection: &str) -> BTreeSet<String> {
        self.feedback
            .iter()
            .filter(|f| f.from == collection)
            .flat_map(|f| f.attributes.iter().cloned())
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
            feedback_edges: self.feedback.len(),
            deferred_attributes: self.feedback.iter().map(|f| f.attributes.len()).sum(),
        }
    }
}

/// Statistics about a dependency graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub feedback_edges: usize,
    pub deferred_attributes: usize,
}

impl std::fmt::Display for GraphStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Dependency Graph Statistics:")?;
        writeln!(f, "  Collections: {}", self.nodes)?;
        writeln!(f, "  Edges: {}", self.edges)?;
        writeln!(
            f,
            "  Feedback edges: {} (deferred attributes: {})",
            self.feedback_edges, self.deferred_attributes
        )
    }
}
