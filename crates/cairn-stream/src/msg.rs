//! Indexed messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handle::{Handle, HandleInfo};

/// Payload of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MsgData {
  /// A handle announcement: the idx `-1` message of every stream, or a
  /// nested sub-stream announcement on a group stream.
  Handle(HandleInfo),
  /// A typed payload value.
  Payload(Value),
  /// The terminal sentinel, exactly one per stream, always last.
  End,
}

/// One message on a handle.
///
/// Indices start at `-1` (the announcement) and increase by exactly one per
/// message; consumers observe them as a gap-free sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
  pub idx: i64,
  pub handle: Handle,
  pub data: MsgData,
}

impl Msg {
  pub fn is_announcement(&self) -> bool {
    self.idx == -1
  }

  pub fn is_end(&self) -> bool {
    matches!(self.data, MsgData::End)
  }

  /// The payload value, if this is a payload message.
  pub fn payload(&self) -> Option<&Value> {
    match &self.data {
      MsgData::Payload(value) => Some(value),
      _ => None,
    }
  }
}
