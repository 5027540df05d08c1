//! Node definitions and content-derived identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};

use cairn_stream::{Handle, Setid};

use crate::context::TaskContext;
use crate::error::NodeError;
use crate::input::{InputSpec, ResolvedInputs};

/// The future a routine factory returns for one invocation.
pub type RoutineFuture = LocalBoxFuture<'static, Result<(), NodeError>>;

/// Factory for one cooperative routine instance.
///
/// Invoked once per driver; the returned future suspends only at
/// [`TaskContext`] protocol calls.
pub type Routine = Arc<dyn Fn(TaskContext, ResolvedInputs) -> RoutineFuture>;

/// How a node publishes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
  /// A single default stream.
  None,
  /// Multiple named sub-streams, created by the routine.
  Always,
  /// Sub-streams created lazily from the demand observed downstream.
  OnDemand,
}

/// Immutable description of one transformation step.
///
/// Identity is a hash over the fullname and the declared inputs (node
/// references contribute their own identity), so it is a pure function of
/// declared data: equal definitions deduplicate to one node instance, and
/// the same definition hashes identically across process restarts.
pub struct NodeDefinition {
  routine: Routine,
  namespace: String,
  name: String,
  fullname: String,
  version: Option<String>,
  output_schema: Option<String>,
  group: GroupMode,
  inputs: Vec<(String, InputSpec)>,
  key: String,
}

impl NodeDefinition {
  /// Start building a definition under `namespace.name`.
  pub fn builder(namespace: impl Into<String>, name: impl Into<String>) -> NodeBuilder {
    NodeBuilder {
      namespace: namespace.into(),
      name: name.into(),
      version: None,
      output_schema: None,
      group: GroupMode::None,
      inputs: Vec::new(),
      routine: None,
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// `namespace.name`.
  pub fn fullname(&self) -> &str {
    &self.fullname
  }

  /// Bumping the version invalidates previously persisted output; it does
  /// not change the node's identity.
  pub fn version(&self) -> Option<&str> {
    self.version.as_deref()
  }

  /// Opaque type tag of the payload, absent for untyped/internal nodes.
  pub fn output_schema(&self) -> Option<&str> {
    self.output_schema.as_deref()
  }

  pub fn group(&self) -> GroupMode {
    self.group
  }

  pub fn inputs(&self) -> &[(String, InputSpec)] {
    &self.inputs
  }

  pub fn routine(&self) -> &Routine {
    &self.routine
  }

  /// Content-derived identity, `<name>-<16 hex digest chars>`.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Handle of this node's default output stream in a dataset.
  pub fn default_stream(&self, setid: Setid) -> Handle {
    Handle::new(setid, self.key.clone(), self.name.clone())
  }

  pub fn has_foreach(&self) -> bool {
    self.inputs.iter().any(|(_, spec)| spec.is_foreach())
  }

  /// Produce a new definition with the named inputs replaced.
  ///
  /// The identity changes with the inputs, so a clone is a distinct node
  /// instance with its own streams and cache entries.
  pub fn clone_with(
    &self,
    overrides: impl IntoIterator<Item = (String, InputSpec)>,
  ) -> Result<Arc<NodeDefinition>, NodeError> {
    let mut inputs = self.inputs.clone();
    for (name, spec) in overrides {
      let slot = inputs
        .iter_mut()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| NodeError::UnknownInput(name.clone()))?;
      slot.1 = spec;
    }
    let key = compute_key(&self.fullname, &self.name, &inputs);
    Ok(Arc::new(NodeDefinition {
      routine: self.routine.clone(),
      namespace: self.namespace.clone(),
      name: self.name.clone(),
      fullname: self.fullname.clone(),
      version: self.version.clone(),
      output_schema: self.output_schema.clone(),
      group: self.group,
      inputs,
      key,
    }))
  }
}

impl fmt::Debug for NodeDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeDefinition")
      .field("key", &self.key)
      .field("fullname", &self.fullname)
      .field("version", &self.version)
      .field("group", &self.group)
      .field("inputs", &self.inputs)
      .finish()
  }
}

impl PartialEq for NodeDefinition {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key
  }
}

impl Eq for NodeDefinition {}

impl Hash for NodeDefinition {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.key.hash(state);
  }
}

/// Builder for [`NodeDefinition`].
pub struct NodeBuilder {
  namespace: String,
  name: String,
  version: Option<String>,
  output_schema: Option<String>,
  group: GroupMode,
  inputs: Vec<(String, InputSpec)>,
  routine: Option<Routine>,
}

impl NodeBuilder {
  pub fn version(mut self, version: impl Into<String>) -> Self {
    self.version = Some(version.into());
    self
  }

  pub fn output_schema(mut self, schema: impl Into<String>) -> Self {
    self.output_schema = Some(schema.into());
    self
  }

  pub fn group(mut self, group: GroupMode) -> Self {
    self.group = group;
    self
  }

  /// Declare an input with an explicit spec.
  pub fn input(mut self, name: impl Into<String>, spec: InputSpec) -> Self {
    self.inputs.push((name.into(), spec));
    self
  }

  /// Declare a literal input.
  pub fn input_value(self, name: impl Into<String>, value: Value) -> Self {
    self.input(name, InputSpec::Value(value))
  }

  /// Declare an input fed by another node's default stream.
  pub fn input_node(self, name: impl Into<String>, node: &Arc<NodeDefinition>) -> Self {
    self.input(name, InputSpec::Node(node.clone()))
  }

  /// Declare an input fed by a named sub-stream of a grouping node.
  pub fn input_sub_stream(
    self,
    name: impl Into<String>,
    node: &Arc<NodeDefinition>,
    stream: impl Into<String>,
  ) -> Self {
    self.input(
      name,
      InputSpec::SubStream {
        node: node.clone(),
        name: stream.into(),
      },
    )
  }

  /// Declare a foreach input over a literal array: one fork per element.
  pub fn foreach_values(self, name: impl Into<String>, values: Value) -> Self {
    self.input(name, InputSpec::foreach(InputSpec::Value(values)))
  }

  /// Declare a foreach input over another node's stream: one fork per
  /// message, discovered at run time.
  pub fn foreach_node(self, name: impl Into<String>, node: &Arc<NodeDefinition>) -> Self {
    self.input(name, InputSpec::foreach(InputSpec::Node(node.clone())))
  }

  /// Set the routine. A definition built without one produces an empty
  /// stream.
  pub fn routine(
    mut self,
    routine: impl Fn(TaskContext, ResolvedInputs) -> RoutineFuture + 'static,
  ) -> Self {
    self.routine = Some(Arc::new(routine));
    self
  }

  pub fn build(self) -> Arc<NodeDefinition> {
    let fullname = format!("{}.{}", self.namespace, self.name);
    let key = compute_key(&fullname, &self.name, &self.inputs);
    Arc::new(NodeDefinition {
      routine: self
        .routine
        .unwrap_or_else(|| Arc::new(|_ctx, _inputs| Box::pin(async { Ok(()) }))),
      namespace: self.namespace,
      name: self.name,
      fullname,
      version: self.version,
      output_schema: self.output_schema,
      group: self.group,
      inputs: self.inputs,
      key,
    })
  }
}

fn compute_key(fullname: &str, name: &str, inputs: &[(String, InputSpec)]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(fullname.as_bytes());

  let mut tokens: Vec<(&str, String)> = inputs
    .iter()
    .map(|(name, spec)| (name.as_str(), spec.identity_token()))
    .collect();
  tokens.sort();
  for (input, token) in tokens {
    hasher.update([0u8]);
    hasher.update(input.as_bytes());
    hasher.update([0u8]);
    hasher.update(token.as_bytes());
  }

  let digest = hasher.finalize();
  let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
  format!("{name}-{hex}")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn raw() -> Arc<NodeDefinition> {
    NodeDefinition::builder("scan", "raw")
      .output_schema("bytes")
      .build()
  }

  fn ranges(upstream: &Arc<NodeDefinition>, offset: i64) -> Arc<NodeDefinition> {
    NodeDefinition::builder("scan", "ranges")
      .input_node("source", upstream)
      .input_value("offset", json!(offset))
      .build()
  }

  #[test]
  fn test_equal_definitions_share_identity() {
    let upstream = raw();
    let a = ranges(&upstream, 5);
    let b = ranges(&upstream, 5);
    assert_eq!(a, b);
    assert_eq!(a.key(), b.key());
  }

  #[test]
  fn test_any_input_change_changes_identity() {
    let upstream = raw();
    let base = ranges(&upstream, 5);
    let other_value = ranges(&upstream, 6);
    assert_ne!(base.key(), other_value.key());

    // Swapping which upstream stream feeds the node changes identity too.
    let other_upstream = NodeDefinition::builder("scan", "filtered").build();
    let rewired = ranges(&other_upstream, 5);
    assert_ne!(base.key(), rewired.key());
  }

  #[test]
  fn test_clone_with_changes_identity() {
    let upstream = raw();
    let base = ranges(&upstream, 0);
    let cloned = base
      .clone_with([("offset".to_string(), InputSpec::Value(json!(5)))])
      .unwrap();
    assert_ne!(base.key(), cloned.key());
    assert_eq!(cloned.fullname(), base.fullname());

    // The same override reproduces the same identity.
    let again = base
      .clone_with([("offset".to_string(), InputSpec::Value(json!(5)))])
      .unwrap();
    assert_eq!(cloned.key(), again.key());
  }

  #[test]
  fn test_clone_with_unknown_input_fails() {
    let base = raw();
    assert!(matches!(
      base.clone_with([("nope".to_string(), InputSpec::Value(json!(1)))]),
      Err(NodeError::UnknownInput(_))
    ));
  }

  #[test]
  fn test_version_does_not_affect_identity() {
    let a = NodeDefinition::builder("scan", "raw").version("1").build();
    let b = NodeDefinition::builder("scan", "raw").version("2").build();
    assert_eq!(a.key(), b.key());
  }

  #[test]
  fn test_input_declaration_order_does_not_affect_identity() {
    let a = NodeDefinition::builder("scan", "sum")
      .input_value("x", json!(1))
      .input_value("y", json!(2))
      .build();
    let b = NodeDefinition::builder("scan", "sum")
      .input_value("y", json!(2))
      .input_value("x", json!(1))
      .build();
    assert_eq!(a.key(), b.key());
  }
}
