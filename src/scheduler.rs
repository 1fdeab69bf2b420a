//! Topological scheduler
//!
//! Kahn layering over a resolved (acyclic) dependency graph. Every
//! collection in layer `i` depends only on collections in layers `< i`, so
//! the members of one layer may be saved concurrently.

use crate::graph::ResolvedGraph;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub layers: Vec<Vec<String>>,
}

impl Schedule {
    pub fn build(graph: &ResolvedGraph) -> Result<Self> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = graph
            .nodes
            .iter()
            .map(|node| (node.as_str(), graph.dependencies_of(node)))
            .collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(node, _)| *node)
                .collect();

            if ready.is_empty() {
                let stuck: Vec<&str> = remaining.keys().copied().collect();
                return Err(Error::Invariant(format!(
                    "Scheduling left collections with unmet dependencies: {}",
                    stuck.join(", ")
                )));
            }

            for node in &ready {
                remaining.remove(node);
            }
            for deps in remaining.values_mut() {
                for node in &ready {
                    deps.remove(node);
                }
            }
            layers.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(Self { layers })
    }

    /// Layer a collection is scheduled in
    pub fn layer_of(&self, collection: &str) -> Option<usize> {
        self.layers.iter().position(|layer| layer.iter().any(|c| c == collection))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn collections(&self) -> impl Iterator<Item = &String> {
        self.layers.iter().flatten()
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, layer) in self.layers.iter().enumerate() {
            writeln!(f, "  Layer {}: {}", i, layer.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyEdge, DependencyGraph};

    fn schedule(nodes: &[&str], edges: &[(&str, &str, &str)]) -> (ResolvedGraph, Schedule) {
        let mut graph = DependencyGraph::new(nodes.iter().copied());
        for (from, to, attr) in edges {
            graph.add_edge(DependencyEdge::attribute(*from, *to, *attr)).unwrap();
        }
        let resolved = graph.resolve_cycles().unwrap();
        let schedule = Schedule::build(&resolved).unwrap();
        (resolved, schedule)
    }

    fn assert_topological(graph: &ResolvedGraph, schedule: &Schedule) {
        for edge in &graph.edges {
            assert!(
                schedule.layer_of(&edge.to).unwrap() < schedule.layer_of(&edge.from).unwrap(),
                "{} scheduled before its dependency",
                edge
            );
        }
        assert_eq!(schedule.collections().count(), graph.nodes.len());
    }

    #[test]
    fn test_layers_are_lexical_and_ordered() {
        let (graph, schedule) = schedule(
            &["vms", "hosts", "clusters", "disks", "flavors"],
            &[
                ("vms", "hosts", "host"),
                ("vms", "flavors", "flavor"),
                ("hosts", "clusters", "cluster"),
                ("disks", "vms", "vm"),
            ],
        );
        assert_eq!(schedule.layers[0], vec!["clusters", "flavors"]);
        assert_eq!(schedule.layers[1], vec!["hosts"]);
        assert_eq!(schedule.layers[2], vec!["vms"]);
        assert_eq!(schedule.layers[3], vec!["disks"]);
        assert_topological(&graph, &schedule);
    }

    #[test]
    fn test_cycle_broken_graph_is_schedulable() {
        let (graph, schedule) = schedule(
            &["a", "b", "c"],
            &[("a", "b", "b_id"), ("b", "c", "c_id"), ("c", "a", "a_id"), ("c", "a", "a2_id")],
        );
        assert_eq!(graph.feedback.len(), 1);
        assert_topological(&graph, &schedule);
        assert_eq!(schedule.len(), 3);
    }

    #[test]
    fn test_leftover_nodes_are_an_invariant_violation() {
        let graph = ResolvedGraph {
            nodes: ["a", "b"].iter().map(|s| s.to_string()).collect(),
            edges: [DependencyEdge::attribute("a", "b", "b_id"), DependencyEdge::attribute("b", "a", "a_id")]
                .into_iter()
                .collect(),
            feedback: Vec::new(),
        };
        assert!(matches!(Schedule::build(&graph), Err(Error::Invariant(_))));
    }
}
