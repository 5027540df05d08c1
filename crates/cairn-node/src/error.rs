//! Node routine error types.

use cairn_stream::StreamError;

/// Errors a node routine can raise or observe through the protocol.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
  /// The routine declines to produce output (e.g. required upstream data is
  /// absent). Downstream consumers observe a normal empty stream; this is
  /// not an engine failure.
  #[error("node aborted: {0}")]
  Abort(String),

  /// A declared input was not resolved.
  #[error("missing input '{0}'")]
  MissingInput(String),

  /// A resolved input had the wrong kind (value where a stream was expected,
  /// or vice versa).
  #[error("input '{name}' is a {actual}, expected a {expected}")]
  InputKind {
    name: String,
    expected: &'static str,
    actual: &'static str,
  },

  /// An override named an input the definition does not declare.
  #[error("unknown input '{0}'")]
  UnknownInput(String),

  /// The engine replied with a variant the request cannot accept. Indicates
  /// a protocol bug, always fatal.
  #[error("unexpected reply to {request}")]
  UnexpectedReply { request: &'static str },

  /// The routine misused the protocol (e.g. `get_requested` outside an
  /// on-demand group, `make_file` on a volatile stream).
  #[error("protocol violation: {0}")]
  Protocol(String),

  /// A stream invariant was violated on this routine's behalf.
  #[error(transparent)]
  Stream(#[from] StreamError),
}

impl NodeError {
  /// Shorthand for a routine-level abort.
  pub fn abort(reason: impl Into<String>) -> Self {
    Self::Abort(reason.into())
  }

  /// True when this error is a routine-level abort rather than a failure.
  pub fn is_abort(&self) -> bool {
    matches!(self, Self::Abort(_))
  }
}
