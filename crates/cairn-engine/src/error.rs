//! Engine error types.

use cairn_store::StoreError;
use cairn_stream::{Handle, StreamError};

use cairn_node::NodeError;

/// Errors that fail a dataset run.
///
/// Scheduling failures carry enough context (handle, requesting node,
/// index) to diagnose the configuration or environment problem; none of
/// them is retried.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The run was cancelled through its cancellation token.
  #[error("run cancelled")]
  Cancelled,

  /// A dependency could not be resolved from a live stream, the store, or
  /// by instantiating a producer.
  #[error("unmet dependency: {handle} requested by node {requester}")]
  UnmetDependency { handle: Handle, requester: String },

  /// A node routine failed with something other than a routine-level abort.
  #[error("node {node} failed: {source}")]
  Node {
    node: String,
    #[source]
    source: NodeError,
  },

  /// A stream invariant was violated.
  #[error(transparent)]
  Stream(#[from] StreamError),

  /// The store failed.
  #[error(transparent)]
  Store(#[from] StoreError),

  /// A driver whose completion is mandatory ended the run still blocked.
  #[error("node {node} did not finish: blocked on {handle} idx {idx}")]
  UnfinishedDriver {
    node: String,
    handle: Handle,
    idx: i64,
  },

  /// The run went idle with dangling state that should be impossible.
  #[error("inconsistent scheduler state: {message}")]
  InconsistentState { message: String },

  /// A routine returned pending without yielding a protocol request — it
  /// awaited a future the engine does not own.
  #[error("node {node} suspended outside the request protocol")]
  ForeignAwait { node: String },

  /// A driver or routine misused the scheduler protocol.
  #[error("protocol violation in node {node}: {message}")]
  Protocol { node: String, message: String },
}
