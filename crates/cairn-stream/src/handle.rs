//! Stream identity and headers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StreamError;
use crate::setid::Setid;

/// Identity of one stream: `(setid, node, name)`.
///
/// `node` is the producing node's content key, not its display name, so two
/// clones of the same node definition never collide. The default stream of a
/// node carries the node's short name; sub-streams carry the name they were
/// created or forked under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
  pub setid: Setid,
  pub node: String,
  pub name: String,
}

impl Handle {
  pub fn new(setid: Setid, node: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      setid,
      node: node.into(),
      name: name.into(),
    }
  }

  /// Derive the handle of a sibling sub-stream under the same node.
  pub fn sub(&self, name: impl Into<String>) -> Self {
    Self {
      setid: self.setid,
      node: self.node.clone(),
      name: name.into(),
    }
  }
}

impl fmt::Display for Handle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.setid, self.node, self.name)
  }
}

/// Insertion-ordered header fields for one stream.
///
/// The header is announced together with the handle and is immutable from
/// then on. Lookups of unknown keys fail loudly instead of silently
/// producing a null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
  fields: Vec<(String, Value)>,
}

impl Header {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
    self.set(key, value);
    self
  }

  /// Insert or replace a field, keeping first-insertion order.
  pub fn set(&mut self, key: impl Into<String>, value: Value) {
    let key = key.into();
    match self.fields.iter_mut().find(|(k, _)| *k == key) {
      Some((_, slot)) => *slot = value,
      None => self.fields.push((key, value)),
    }
  }

  /// Look up a field, failing with [`StreamError::UnknownHeaderField`] when
  /// the key is not present.
  pub fn get(&self, key: &str) -> Result<&Value, StreamError> {
    self.try_get(key).ok_or_else(|| StreamError::UnknownHeaderField {
      key: key.to_string(),
    })
  }

  /// Look up a field that may legitimately be absent.
  pub fn try_get(&self, key: &str) -> Option<&Value> {
    self
      .fields
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, value)| value)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.fields.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }
}

/// The announcement payload of a stream: its handle, group flag, and header.
///
/// This is the data of the idx `-1` message on every stream, and of the
/// nested announcement messages a group stream emits for its sub-streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleInfo {
  pub handle: Handle,
  pub group: bool,
  pub header: Header,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_header_preserves_insertion_order() {
    let header = Header::new()
      .with("topic", json!("/camera/front"))
      .with("msg_type", json!("sensor_msgs/Image"))
      .with("frames", json!(1200));
    let keys: Vec<&str> = header.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["topic", "msg_type", "frames"]);
  }

  #[test]
  fn test_header_unknown_key_fails() {
    let header = Header::new().with("topic", json!("/gps"));
    assert!(header.get("topic").is_ok());
    let err = header.get("fooBar").unwrap_err();
    assert!(matches!(err, StreamError::UnknownHeaderField { key } if key == "fooBar"));
  }

  #[test]
  fn test_header_set_replaces_in_place() {
    let mut header = Header::new().with("a", json!(1)).with("b", json!(2));
    header.set("a", json!(3));
    assert_eq!(header.get("a").unwrap(), &json!(3));
    let keys: Vec<&str> = header.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a", "b"]);
  }

  #[test]
  fn test_handle_sub() {
    let handle = Handle::new(Setid::from_u128(1), "images-93f2ab44c0d611aa", "images");
    let sub = handle.sub("0");
    assert_eq!(sub.node, handle.node);
    assert_eq!(sub.name, "0");
  }
}
