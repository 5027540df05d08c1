//! Dependency graph over node definitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::input::InputSpec;
use crate::node::NodeDefinition;

/// The dependency graph spanned by a set of root definitions.
///
/// Edges run from a dependency to its dependents, keyed by node identity.
/// The engine resolves dependencies lazily at run time; this structure
/// serves static inspection — which nodes feed which, and what is
/// transitively invalidated by a change.
#[derive(Debug, Clone)]
pub struct Graph {
  /// All reachable definitions by key.
  nodes: HashMap<String, Arc<NodeDefinition>>,
  /// node key -> keys of direct dependents (downstream).
  adjacency: HashMap<String, Vec<String>>,
  /// node key -> keys of direct dependencies (upstream).
  reverse_adjacency: HashMap<String, Vec<String>>,
}

impl Graph {
  /// Build the graph reachable from `roots` by walking input specs.
  pub fn new(roots: &[Arc<NodeDefinition>]) -> Self {
    let mut nodes: HashMap<String, Arc<NodeDefinition>> = HashMap::new();
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    let mut stack: Vec<Arc<NodeDefinition>> = roots.to_vec();
    while let Some(node) = stack.pop() {
      let key = node.key().to_string();
      if nodes.contains_key(&key) {
        continue;
      }
      adjacency.entry(key.clone()).or_default();
      reverse_adjacency.entry(key.clone()).or_default();

      for (_, spec) in node.inputs() {
        for dep in spec_dependencies(spec) {
          let dep_key = dep.key().to_string();
          let downstream = adjacency.entry(dep_key.clone()).or_default();
          if !downstream.contains(&key) {
            downstream.push(key.clone());
          }
          let upstream = reverse_adjacency.entry(key.clone()).or_default();
          if !upstream.contains(&dep_key) {
            upstream.push(dep_key);
          }
          stack.push(dep);
        }
      }

      nodes.insert(key, node);
    }

    Self {
      nodes,
      adjacency,
      reverse_adjacency,
    }
  }

  /// Look up a definition by key.
  pub fn node(&self, key: &str) -> Option<&Arc<NodeDefinition>> {
    self.nodes.get(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.nodes.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Direct dependents of a node.
  pub fn downstream(&self, key: &str) -> &[String] {
    self
      .adjacency
      .get(key)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Direct dependencies of a node.
  pub fn upstream(&self, key: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(key)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Nodes with no dependencies.
  pub fn entry_points(&self) -> Vec<&str> {
    self
      .nodes
      .keys()
      .filter(|key| self.upstream(key).is_empty())
      .map(String::as_str)
      .collect()
  }

  /// Every node that directly or transitively consumes `key`.
  pub fn transitive_dependents(&self, key: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = self.downstream(key).iter().map(String::as_str).collect();
    while let Some(current) = stack.pop() {
      if seen.insert(current.to_string()) {
        stack.extend(self.downstream(current).iter().map(String::as_str));
      }
    }
    seen
  }
}

fn spec_dependencies(spec: &InputSpec) -> Vec<Arc<NodeDefinition>> {
  match spec {
    InputSpec::Node(node) => vec![node.clone()],
    InputSpec::SubStream { node, .. } => vec![node.clone()],
    InputSpec::Foreach(inner) => spec_dependencies(inner),
    InputSpec::Value(_) | InputSpec::Handle(_) => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_diamond_dependencies() {
    let raw = NodeDefinition::builder("scan", "raw").build();
    let left = NodeDefinition::builder("scan", "left")
      .input_node("source", &raw)
      .build();
    let right = NodeDefinition::builder("scan", "right")
      .input_node("source", &raw)
      .build();
    let merged = NodeDefinition::builder("scan", "merged")
      .input_node("a", &left)
      .input_node("b", &right)
      .build();

    let graph = Graph::new(&[merged.clone()]);
    assert_eq!(graph.len(), 4);
    assert_eq!(graph.entry_points(), vec![raw.key()]);

    let mut downstream = graph.downstream(raw.key()).to_vec();
    downstream.sort();
    let mut expected = vec![left.key().to_string(), right.key().to_string()];
    expected.sort();
    assert_eq!(downstream, expected);

    let dependents = graph.transitive_dependents(raw.key());
    assert_eq!(dependents.len(), 3);
    assert!(dependents.contains(merged.key()));
  }

  #[test]
  fn test_foreach_edges_count_as_dependencies() {
    let topics = NodeDefinition::builder("scan", "topics").build();
    let per_topic = NodeDefinition::builder("scan", "per_topic")
      .foreach_node("topic", &topics)
      .input_value("quality", json!("high"))
      .build();

    let graph = Graph::new(&[per_topic.clone()]);
    assert_eq!(graph.upstream(per_topic.key()), &[topics.key().to_string()]);
  }

  #[test]
  fn test_shared_dependency_deduplicates() {
    let raw = NodeDefinition::builder("scan", "raw").build();
    let a = NodeDefinition::builder("scan", "a")
      .input_node("x", &raw)
      .input_node("y", &raw)
      .build();
    let graph = Graph::new(&[a.clone()]);
    assert_eq!(graph.downstream(raw.key()).len(), 1);
    assert_eq!(graph.upstream(a.key()).len(), 1);
  }
}
