//! Cairn Store
//!
//! This crate provides durable storage for node outputs. Each node instance
//! owns a directory of numbered generations with a `current` pointer that is
//! flipped atomically on commit, so concurrent readers always observe a
//! fully previous or fully new generation, never a partial one.
//!
//! The [`Store`] trait defines the narrow contract the engine consumes:
//! - `load` resolves previously committed output for dependency resolution
//! - `create_staging` allocates a locked staging area for an in-progress run
//!
//! [`Staging`] hands out per-stream writers implementing
//! [`cairn_stream::Persistence`] and performs the atomic commit.

mod fs;

pub use fs::FsStore;

use std::collections::HashMap;
use std::path::PathBuf;

use cairn_stream::{Msg, Persistence, Setid};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// No committed, version-matching output exists for this node.
  #[error("no committed output for node {node} in dataset {setid}")]
  NotFound { setid: Setid, node: String },

  /// A locked staging directory already exists for this node, meaning a
  /// concurrent run (or a crashed run still holding its lock) is producing
  /// the same output.
  #[error("staging for node {node} already exists and is locked: {path}")]
  DirectoryAlreadyExists { node: String, path: PathBuf },

  /// An artifact or stream name was allocated twice within one staging.
  #[error("name already taken in staging: {name}")]
  NameTaken { name: String },

  /// A committed entry could not be read back.
  #[error("corrupt store entry at {path}: {message}")]
  Corrupt { path: PathBuf, message: String },

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Committed output of one node: every stream's full message log, keyed by
/// stream name.
#[derive(Debug)]
pub struct StoredNode {
  pub version: Option<String>,
  pub streams: HashMap<String, Vec<Msg>>,
}

/// Storage contract consumed by the engine.
pub trait Store {
  /// Load the committed output of a node, if any.
  ///
  /// A committed generation whose recorded version differs from `version`
  /// reads as [`StoreError::NotFound`] — bumping a node's version
  /// invalidates its prior output.
  fn load(
    &self,
    setid: Setid,
    node_key: &str,
    version: Option<&str>,
  ) -> Result<StoredNode, StoreError>;

  /// Allocate a locked staging area for a new generation of a node's
  /// output.
  fn create_staging(
    &self,
    setid: Setid,
    node_key: &str,
    version: Option<&str>,
  ) -> Result<Box<dyn Staging>, StoreError>;
}

/// An in-progress, locked generation of one node's output.
///
/// Dropped without [`Staging::commit`], the staging directory stays behind
/// unlocked and is cleared by the next run.
pub trait Staging {
  /// Start a new stream file inside the staging area.
  fn create_stream(&mut self, name: &str) -> Result<Box<dyn Persistence>, StoreError>;

  /// Discard everything staged so far, keeping the lock. Used when a node
  /// is torn down and restarted mid-run.
  fn reset(&mut self) -> Result<(), StoreError>;

  /// Atomically publish the staged output as the next generation and point
  /// `current` at it. Returns the generation number.
  fn commit(&mut self) -> Result<u64, StoreError>;
}
