//! Run results.

use cairn_stream::Setid;

/// Summary of one dataset run.
#[derive(Debug)]
pub struct RunReport {
  pub setid: Setid,
  /// Keys of nodes whose drivers ran to completion, in completion order.
  pub finished: Vec<String>,
  /// Keys of requested nodes resolved from a current committed generation
  /// without re-running.
  pub cached: Vec<String>,
  /// `(node key, generation)` for every output committed by this run.
  pub committed: Vec<(String, u64)>,
  /// Keys of on-demand nodes that were torn down and restarted after their
  /// demanded sub-stream set grew, one entry per restart.
  pub restarted: Vec<String>,
}

impl RunReport {
  pub fn new(setid: Setid) -> Self {
    Self {
      setid,
      finished: Vec::new(),
      cached: Vec::new(),
      committed: Vec::new(),
      restarted: Vec::new(),
    }
  }
}
