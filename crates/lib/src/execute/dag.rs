//! Dependency graph over the artifacts of a run.
//!
//! Artifacts are nodes (indexed in declaration order), and an edge runs from
//! a dependency to each artifact that references it. The graph is layered
//! with Kahn's algorithm: every layer holds the artifacts whose dependencies
//! all sit in earlier layers, so a layer can be built concurrently.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::artifact::Artifact;
use crate::buildargs::{ModeOverlays, referenced_artifacts};
use crate::resolver::TagLookup;
use crate::types::RunMode;

use super::types::ExecuteError;

/// A layered, acyclic dependency graph of artifacts.
#[derive(Debug)]
pub struct ArtifactGraph {
  /// Node weights are artifact names; edges point dependency -> dependent.
  graph: DiGraph<String, ()>,

  /// Map from artifact name to node index.
  nodes: HashMap<String, NodeIndex>,

  /// Build layers, each in declaration order.
  layers: Vec<Vec<String>>,
}

impl ArtifactGraph {
  /// Build the graph from declared artifacts and the names each references.
  ///
  /// References to names that are not declared are accepted only when
  /// `is_external` returns true for them (e.g. images built by an earlier
  /// run); they add no edge.
  ///
  /// # Errors
  ///
  /// - `DuplicateArtifact` if a name is declared twice
  /// - `UnresolvedReference` for a reference that is neither declared nor external
  /// - `CyclicDependency` naming the artifacts on a cycle
  pub fn new<F>(declared: &[(String, Vec<String>)], is_external: F) -> Result<Self, ExecuteError>
  where
    F: Fn(&str) -> bool,
  {
    let mut graph = DiGraph::with_capacity(declared.len(), declared.len());
    let mut nodes = HashMap::with_capacity(declared.len());

    // First pass: one node per artifact
    for (name, _) in declared {
      if nodes.contains_key(name) {
        return Err(ExecuteError::DuplicateArtifact(name.clone()));
      }
      let idx = graph.add_node(name.clone());
      nodes.insert(name.clone(), idx);
    }

    // Second pass: edges from dependency to dependent
    for (name, references) in declared {
      let dependent_idx = nodes[name];

      for reference in references {
        if let Some(&dep_idx) = nodes.get(reference) {
          graph.update_edge(dep_idx, dependent_idx, ());
        } else if is_external(reference) {
          debug!(artifact = %name, reference = %reference, "reference resolved outside the run");
        } else {
          return Err(ExecuteError::UnresolvedReference {
            artifact: name.clone(),
            reference: reference.clone(),
          });
        }
      }
    }

    let mut dag = Self {
      graph,
      nodes,
      layers: Vec::new(),
    };
    dag.layers = dag.compute_layers()?;

    Ok(dag)
  }

  /// Build the graph for a set of artifacts in the given run mode.
  ///
  /// Names already known to `prebuilt` count as external references.
  pub fn from_artifacts<T: TagLookup + ?Sized>(
    artifacts: &[Artifact],
    mode: RunMode,
    overlays: &ModeOverlays,
    prebuilt: &T,
  ) -> Result<Self, ExecuteError> {
    let declared = artifacts
      .iter()
      .map(|artifact| -> Result<_, ExecuteError> {
        let refs = referenced_artifacts(mode, artifact, overlays)?;
        Ok((artifact.image_name.clone(), refs))
      })
      .collect::<Result<Vec<_>, ExecuteError>>()?;

    Self::new(&declared, |name| prebuilt.lookup(name).is_some())
  }

  /// Kahn layering with declaration-order tie-break.
  fn compute_layers(&self) -> Result<Vec<Vec<String>>, ExecuteError> {
    let mut in_degree: Vec<usize> = self
      .graph
      .node_indices()
      .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
      .collect();

    let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
      let (ready, rest): (Vec<NodeIndex>, Vec<NodeIndex>) =
        remaining.into_iter().partition(|idx| in_degree[idx.index()] == 0);

      if ready.is_empty() {
        return Err(ExecuteError::CyclicDependency(self.cycle_members()));
      }

      for &idx in &ready {
        for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          in_degree[dependent.index()] = in_degree[dependent.index()].saturating_sub(1);
        }
      }

      layers.push(ready.into_iter().map(|idx| self.graph[idx].clone()).collect());
      remaining = rest;
    }

    Ok(layers)
  }

  /// Names of all artifacts that sit on a cycle, in declaration order.
  fn cycle_members(&self) -> Vec<String> {
    let mut members: Vec<NodeIndex> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .flatten()
      .collect();
    members.sort();
    members.into_iter().map(|idx| self.graph[idx].clone()).collect()
  }

  /// Build layers; every dependency is in a strictly earlier layer.
  pub fn layers(&self) -> &[Vec<String>] {
    &self.layers
  }

  /// Index of the layer containing `name`.
  pub fn layer_of(&self, name: &str) -> Option<usize> {
    self.layers.iter().position(|layer| layer.iter().any(|n| n == name))
  }

  /// Direct dependencies of an artifact, in declaration order.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };

    let mut deps: Vec<NodeIndex> = self.graph.neighbors_directed(idx, Direction::Incoming).collect();
    deps.sort();
    deps.into_iter().map(|dep| self.graph[dep].clone()).collect()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  /// Number of artifacts in the graph.
  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }
}
