//! Stream dependency graph: topological sort and cycle detection.
//!
//! The sync driver runs streams in an order that respects each stream's
//! declared `dependencies` (§4.8): every dependency of a stream must finish
//! emitting records before that stream starts. This module builds that graph
//! from a catalog of stream names and produces a run order.
//!
//! # Prior Art
//!
//! Topological ordering and cycle detection both use Kahn's algorithm:
//! - Kahn, A.B. (1962). "Topological sorting of large networks."
//!   Communications of the ACM, 5(11), 558–562.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::SourceError;

/// A dependency graph over a fixed set of stream names.
#[derive(Debug, Default)]
pub struct StreamDag {
    nodes: HashSet<String>,
    /// edges[a] = streams that depend on `a` (i.e. `a` must run first).
    edges: HashMap<String, Vec<String>>,
}

impl StreamDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(name, dependencies)` pairs, as declared by each
    /// requested stream's descriptor.
    pub fn build(streams: &[(String, Vec<String>)]) -> Result<Self, SourceError> {
        let mut dag = StreamDag::new();
        let known: HashSet<&str> = streams.iter().map(|(n, _)| n.as_str()).collect();

        for (name, _) in streams {
            dag.nodes.insert(name.clone());
        }
        for (name, deps) in streams {
            for dep in deps {
                if !known.contains(dep.as_str()) {
                    return Err(SourceError::UnknownStream(format!(
                        "{name} depends on unknown stream {dep}"
                    )));
                }
                dag.edges.entry(dep.clone()).or_default().push(name.clone());
            }
        }
        Ok(dag)
    }

    /// Return stream names in topological order (dependencies first).
    ///
    /// Errs with [`SourceError::CycleDetected`] if the dependency graph is
    /// not acyclic.
    pub fn topological_order(&self) -> Result<Vec<String>, SourceError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for n in &self.nodes {
            in_degree.entry(n.as_str()).or_insert(0);
        }
        for targets in self.edges.values() {
            for t in targets {
                *in_degree.entry(t.as_str()).or_insert(0) += 1;
            }
        }

        // Deterministic iteration: sort the initial ready queue so run order
        // doesn't depend on hash-map iteration order when independent
        // streams tie on in-degree.
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(&n, _)| n)
            .collect();
        ready.sort_unstable();
        let mut queue: VecDeque<&str> = ready.into_iter().collect();

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());
            if let Some(downstream) = self.edges.get(node) {
                let mut newly_ready = Vec::new();
                for d in downstream {
                    let deg = in_degree.get_mut(d.as_str()).expect("node in edges must be known");
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(d.as_str());
                    }
                }
                newly_ready.sort_unstable();
                for n in newly_ready {
                    queue.push_back(n);
                }
            }
        }

        if result.len() < self.nodes.len() {
            let processed: HashSet<&str> = result.iter().map(|s| s.as_str()).collect();
            let mut cyclic: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| !processed.contains(n.as_str()))
                .cloned()
                .collect();
            cyclic.sort();
            return Err(SourceError::CycleDetected(cyclic));
        }

        Ok(result)
    }
}
