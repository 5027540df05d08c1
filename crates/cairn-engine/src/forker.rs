//! Foreach expansion: the engine-built routine for nodes with `foreach`
//! inputs.
//!
//! The forker computes the cross product of every constant `foreach` input
//! (a literal JSON array) with, for at most one `foreach` stream input, each
//! element pulled from that stream at run time. Every product element spawns
//! one fork, named by a monotonically increasing index, carrying the
//! concrete input overrides.

use std::sync::Arc;

use serde_json::Value;

use cairn_node::{
  InputValue, Item, NodeDefinition, NodeError, ResolvedInputs, RoutineFuture, TaskContext,
};
use cairn_stream::Handle;

pub(crate) fn build_forker(
  ctx: TaskContext,
  node: Arc<NodeDefinition>,
  inputs: ResolvedInputs,
) -> RoutineFuture {
  Box::pin(async move {
    let mut constants: Vec<(String, Vec<Value>)> = Vec::new();
    let mut stream_input: Option<(String, Handle)> = None;

    for (name, spec) in node.inputs() {
      if !spec.is_foreach() {
        continue;
      }
      match inputs.get(name) {
        Some(InputValue::Value(value)) => {
          let elements = value
            .as_array()
            .ok_or_else(|| NodeError::InputKind {
              name: name.clone(),
              expected: "array",
              actual: "scalar",
            })?
            .clone();
          constants.push((name.clone(), elements));
        }
        Some(InputValue::Stream(handle)) => {
          if stream_input.is_some() {
            return Err(NodeError::Protocol(format!(
              "node {} declares more than one foreach stream input",
              node.fullname()
            )));
          }
          stream_input = Some((name.clone(), handle.clone()));
        }
        None => return Err(NodeError::MissingInput(name.clone())),
      }
    }

    let combos = cross_product(&constants);
    let mut next = 0u64;

    match stream_input {
      Some((stream_name, handle)) => {
        while let Some(item) = ctx.pull(&handle).await? {
          let element = match item {
            Item::Value(value) => InputValue::Value(value),
            Item::Stream(info) => InputValue::Stream(info.handle),
          };
          for combo in &combos {
            let mut overrides = combo.clone();
            overrides.push((stream_name.clone(), element.clone()));
            ctx.fork(&next.to_string(), overrides).await?;
            next += 1;
          }
        }
      }
      None => {
        for combo in &combos {
          ctx.fork(&next.to_string(), combo.clone()).await?;
          next += 1;
        }
      }
    }

    Ok(())
  })
}

/// Cross product over the constant foreach inputs, as override lists. With
/// no constant inputs this is a single empty combination.
fn cross_product(constants: &[(String, Vec<Value>)]) -> Vec<Vec<(String, InputValue)>> {
  let mut combos: Vec<Vec<(String, InputValue)>> = vec![Vec::new()];
  for (name, elements) in constants {
    let mut expanded = Vec::with_capacity(combos.len() * elements.len());
    for combo in &combos {
      for element in elements {
        let mut next = combo.clone();
        next.push((name.clone(), InputValue::Value(element.clone())));
        expanded.push(next);
      }
    }
    combos = expanded;
  }
  combos
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_cross_product_of_two_arrays() {
    let constants = vec![
      ("a".to_string(), vec![json!(1), json!(2)]),
      ("b".to_string(), vec![json!("x"), json!("y")]),
    ];
    let combos = cross_product(&constants);
    assert_eq!(combos.len(), 4);
    for combo in &combos {
      assert_eq!(combo.len(), 2);
    }
  }

  #[test]
  fn test_cross_product_empty_constants() {
    assert_eq!(cross_product(&[]).len(), 1);
  }

  #[test]
  fn test_cross_product_with_empty_array_is_empty() {
    let constants = vec![("a".to_string(), Vec::new())];
    assert!(cross_product(&constants).is_empty());
  }
}
