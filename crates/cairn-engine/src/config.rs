//! Run configuration.

use std::path::PathBuf;

use serde::Deserialize;

use cairn_stream::DEFAULT_CACHE_SIZE;

/// Configuration for one dataset run.
///
/// Deserializable so embedders can load it from JSON alongside their own
/// collection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
  /// Root directory of the persistent store. Without one, every stream is
  /// volatile and previously committed output cannot be reused.
  pub store_root: Option<PathBuf>,

  /// Fullnames of nodes whose output is persisted. Persisted nodes must
  /// finish for the run to succeed.
  pub persist: Vec<String>,

  /// Instantiate producers for unresolved dependencies. When disabled, a
  /// dependency that is neither live nor in the store fails the run.
  pub materialize_deps: bool,

  /// Re-run requested nodes even when a committed generation is current.
  pub force: bool,

  /// Replay window per stream, in messages.
  pub cache_size: usize,
}

impl Default for RunConfig {
  fn default() -> Self {
    Self {
      store_root: None,
      persist: Vec::new(),
      materialize_deps: true,
      force: false,
      cache_size: DEFAULT_CACHE_SIZE,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = RunConfig::default();
    assert!(config.materialize_deps);
    assert!(!config.force);
    assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
  }

  #[test]
  fn test_deserialize_partial() {
    let config: RunConfig =
      serde_json::from_str(r#"{ "persist": ["scan.ranges"], "cache_size": 10 }"#).unwrap();
    assert_eq!(config.persist, vec!["scan.ranges".to_string()]);
    assert_eq!(config.cache_size, 10);
    assert!(config.materialize_deps);
  }
}
