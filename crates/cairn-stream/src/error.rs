//! Stream error types.

use crate::handle::Handle;

/// Errors raised by stream and identity primitives.
///
/// The index and header variants are protocol invariant violations: a node
/// routine (or the engine itself) broke the append/read contract. They are
/// never recovered from — the run fails.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
  /// A message was appended with an index other than `previous + 1`.
  #[error("non-monotonic index on {handle}: expected {expected}, got {got}")]
  NonMonotonicIdx {
    handle: Handle,
    expected: i64,
    got: i64,
  },

  /// A consumer fell further behind the producer than the cache window.
  #[error("message {idx} on {handle} is no longer cached (oldest is {oldest})")]
  RequestedMessageTooOld { handle: Handle, idx: i64, oldest: i64 },

  /// A message was appended after the terminal end message.
  #[error("stream {handle} already ended")]
  AlreadyEnded { handle: Handle },

  /// The header was set after the stream was announced.
  #[error("stream {handle} already announced, header is immutable")]
  AlreadyAnnounced { handle: Handle },

  /// A message was appended before the stream was announced.
  #[error("stream {handle} not announced yet")]
  NotAnnounced { handle: Handle },

  /// A header accessor was asked for a field the header does not carry.
  #[error("unknown header field '{key}'")]
  UnknownHeaderField { key: String },

  /// `make_file` was requested on a volatile stream.
  #[error("make_file not supported on volatile stream {handle}")]
  MakeFileNotSupported { handle: Handle },

  /// A textual setid failed to decode.
  #[error("invalid setid '{input}': {reason}")]
  InvalidSetid { input: String, reason: &'static str },

  /// An I/O error from the persistence backing.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
