//! Dependency graph and stage resolution built on `petgraph`.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::RuleSetError;
use crate::metadata::RuleMetadata;

/// A directed graph of rule scheduling constraints.
///
/// An edge runs from a provider to a dependent: for every name in a rule's
/// `dependencies`, every rule providing that name (other than the dependent
/// itself) must be scheduled in a strictly earlier stage. A dependency on a
/// name no rule provides is a construction error; so is a cycle, surfaced
/// when stages are resolved.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<usize, ()>,
    names: Vec<String>,
}

impl DependencyGraph {
    /// Build the constraint graph for a slice of rule metadata.
    ///
    /// Returns [`RuleSetError::EmptyRuleName`] for a malformed rule and
    /// [`RuleSetError::MissingProvider`] for a dependency with no provider.
    pub fn new(rules: &[&RuleMetadata]) -> Result<Self, RuleSetError> {
        let mut graph = DiGraph::new();
        let mut names = Vec::with_capacity(rules.len());
        let mut indices = Vec::with_capacity(rules.len());

        for (i, rule) in rules.iter().enumerate() {
            if rule.name.is_empty() {
                return Err(RuleSetError::EmptyRuleName);
            }
            indices.push(graph.add_node(i));
            names.push(rule.name.clone());
        }

        // A name may have several providers; all of them gate the dependent.
        let mut providers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            for name in &rule.provides {
                providers.entry(name.as_str()).or_default().push(i);
            }
        }

        let mut seen = HashSet::new();
        for (i, rule) in rules.iter().enumerate() {
            for dep in &rule.dependencies {
                let Some(sources) = providers.get(dep.as_str()) else {
                    return Err(RuleSetError::MissingProvider {
                        rule: rule.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                for &src in sources {
                    // A rule never gates itself through its own provides.
                    if src != i && seen.insert((src, i)) {
                        graph.add_edge(indices[src], indices[i], ());
                    }
                }
            }
        }

        Ok(Self { graph, names })
    }

    /// Returns `true` if the constraint graph contains at least one cycle.
    #[must_use]
    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Number of rules in the graph.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Compute execution stages using Kahn's algorithm with level batching.
    ///
    /// Each stage holds the indices (into the input slice) of rules whose
    /// providers all appear in earlier stages, so the rules within one
    /// stage may execute concurrently. Input order is preserved within a
    /// stage for determinism, but callers must not rely on it for
    /// correctness.
    pub fn resolve_stages(&self) -> Result<Vec<Vec<usize>>, RuleSetError> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            in_degree.insert(
                idx,
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count(),
            );
        }

        let mut stages = Vec::new();
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let current: Vec<NodeIndex> = remaining
                .iter()
                .filter(|idx| in_degree[idx] == 0)
                .copied()
                .collect();

            if current.is_empty() {
                // No schedulable rule left: a cycle, reported with the
                // names still waiting so the caller can see what is stuck.
                let unresolved = remaining
                    .iter()
                    .map(|&idx| self.names[self.graph[idx]].clone())
                    .collect();
                return Err(RuleSetError::CycleDetected { unresolved });
            }

            for &idx in &current {
                for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    in_degree.entry(neighbor).and_modify(|deg| *deg -= 1);
                }
            }

            remaining.retain(|idx| !current.contains(idx));
            for idx in &current {
                in_degree.remove(idx);
            }

            stages.push(current.into_iter().map(|idx| self.graph[idx]).collect());
        }

        Ok(stages)
    }
}

/// Resolve a slice of rule metadata straight to execution stages.
///
/// Convenience for engine construction; equivalent to building a
/// [`DependencyGraph`] and calling [`DependencyGraph::resolve_stages`].
pub fn resolve_stages(rules: &[&RuleMetadata]) -> Result<Vec<Vec<usize>>, RuleSetError> {
    DependencyGraph::new(rules)?.resolve_stages()
}
