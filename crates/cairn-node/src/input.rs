//! Declared and resolved node inputs.

use std::sync::Arc;

use serde_json::Value;

use cairn_stream::Handle;

use crate::error::NodeError;
use crate::node::NodeDefinition;

/// One declared input of a node definition.
#[derive(Clone)]
pub enum InputSpec {
  /// A literal value.
  Value(Value),
  /// Another node's default output stream.
  Node(Arc<NodeDefinition>),
  /// A specific named sub-stream of a grouping node.
  SubStream {
    node: Arc<NodeDefinition>,
    name: String,
  },
  /// A pre-resolved stream handle. Produced by fork expansion, where the
  /// concrete sub-stream was only discovered at run time.
  Handle(Handle),
  /// Any of the above, instantiated once per element (fork on invocation).
  Foreach(Box<InputSpec>),
}

impl InputSpec {
  /// Wrap a spec so it forks one sub-task per element.
  pub fn foreach(spec: InputSpec) -> Self {
    Self::Foreach(Box::new(spec))
  }

  pub fn is_foreach(&self) -> bool {
    matches!(self, Self::Foreach(_))
  }

  /// Stable token feeding the owning definition's identity hash.
  ///
  /// Node references contribute their own key, so identity recurses through
  /// the dependency graph and bottoms out at literals.
  pub(crate) fn identity_token(&self) -> String {
    match self {
      Self::Value(value) => format!("value:{value}"),
      Self::Node(node) => format!("node:{}", node.key()),
      Self::SubStream { node, name } => format!("substream:{}:{name}", node.key()),
      Self::Handle(handle) => format!("handle:{handle}"),
      Self::Foreach(inner) => format!("foreach:{}", inner.identity_token()),
    }
  }
}

impl std::fmt::Debug for InputSpec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Value(value) => write!(f, "Value({value})"),
      Self::Node(node) => write!(f, "Node({})", node.key()),
      Self::SubStream { node, name } => write!(f, "SubStream({}, {name})", node.key()),
      Self::Handle(handle) => write!(f, "Handle({handle})"),
      Self::Foreach(inner) => write!(f, "Foreach({inner:?})"),
    }
  }
}

/// One resolved input as handed to a running routine.
#[derive(Debug, Clone)]
pub enum InputValue {
  /// A literal value.
  Value(Value),
  /// A stream to pull from.
  Stream(Handle),
}

/// The resolved inputs of one node instance, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
  values: Vec<(String, InputValue)>,
}

impl ResolvedInputs {
  pub fn new(values: Vec<(String, InputValue)>) -> Self {
    Self { values }
  }

  pub fn get(&self, name: &str) -> Option<&InputValue> {
    self
      .values
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, value)| value)
  }

  /// The literal value of an input, failing when it is absent or a stream.
  pub fn value(&self, name: &str) -> Result<&Value, NodeError> {
    match self.get(name) {
      Some(InputValue::Value(value)) => Ok(value),
      Some(InputValue::Stream(_)) => Err(NodeError::InputKind {
        name: name.to_string(),
        expected: "value",
        actual: "stream",
      }),
      None => Err(NodeError::MissingInput(name.to_string())),
    }
  }

  /// The stream handle of an input, failing when it is absent or a literal.
  pub fn stream(&self, name: &str) -> Result<&Handle, NodeError> {
    match self.get(name) {
      Some(InputValue::Stream(handle)) => Ok(handle),
      Some(InputValue::Value(_)) => Err(NodeError::InputKind {
        name: name.to_string(),
        expected: "stream",
        actual: "value",
      }),
      None => Err(NodeError::MissingInput(name.to_string())),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &InputValue)> {
    self.values.iter().map(|(n, v)| (n.as_str(), v))
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cairn_stream::Setid;
  use serde_json::json;

  #[test]
  fn test_resolved_inputs_accessors() {
    let handle = Handle::new(Setid::from_u128(3), "raw-aabbccdd00112233", "raw");
    let inputs = ResolvedInputs::new(vec![
      ("offset".to_string(), InputValue::Value(json!(5))),
      ("source".to_string(), InputValue::Stream(handle.clone())),
    ]);

    assert_eq!(inputs.value("offset").unwrap(), &json!(5));
    assert_eq!(inputs.stream("source").unwrap(), &handle);
    assert!(matches!(
      inputs.value("source"),
      Err(NodeError::InputKind { .. })
    ));
    assert!(matches!(
      inputs.stream("missing"),
      Err(NodeError::MissingInput(_))
    ));
  }
}
