//! Driver: one running node instance as the scheduler sees it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

use cairn_node::{
  Item, NodeDefinition, NodeError, PullReply, Reply, Request, RoutineFuture, SharedSlot,
};
use cairn_stream::{Handle, Msg, MsgData, Stream};

use crate::error::EngineError;

/// Arena-style key for one driver. All cross references between scheduler
/// structures are ids, never pointers, so teardown and restart can
/// invalidate entries safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct DriverId(pub u64);

impl fmt::Display for DriverId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "driver-{}", self.0)
  }
}

/// Outcome of resuming a routine once.
pub(crate) enum Step {
  /// The routine suspended at a protocol request.
  Yielded(Request),
  /// The routine ran to completion.
  Done(Result<(), NodeError>),
}

/// The request a suspended routine is currently blocked on, from the
/// scheduler's perspective.
pub(crate) enum PendingRequest {
  None,
  Pull {
    handle: Handle,
  },
  /// Barrier join: slots fill as messages arrive; the reply is assembled
  /// only once every slot is filled.
  PullAll {
    handles: Vec<Handle>,
    replies: Vec<Option<PullReply>>,
  },
  /// Waiting for another stream's announcement.
  GetStream {
    handle: Handle,
  },
  /// Paused until the scheduler reports the stable demanded sub-stream set.
  Requested,
}

/// Runtime state for one instance of a node's routine.
///
/// Owns the routine future, the mailbox slot shared with it, the primary
/// stream plus any sub-streams this instance created, and the per-upstream
/// read cursors of the routine.
pub(crate) struct Driver {
  pub id: DriverId,
  pub node: Arc<NodeDefinition>,
  /// Name of the primary stream within `streams` (the node's short name,
  /// or the fork name for forked instances).
  pub primary: String,
  /// Streams owned by this driver, keyed by stream name.
  pub streams: HashMap<String, Stream>,
  /// Parent stream handle when the primary stream is a sub-stream.
  pub parent: Option<Handle>,
  pub pending: PendingRequest,
  /// The demand set this on-demand driver was last resumed with.
  pub requested_answered: Option<Vec<String>>,
  pub fork_count: u64,
  slot: SharedSlot,
  routine: Option<RoutineFuture>,
  cursors: HashMap<Handle, i64>,
  counts: HashMap<Handle, u64>,
  ended_inputs: HashSet<Handle>,
  started: bool,
  pub stopped: bool,
}

impl Driver {
  pub fn new(
    id: DriverId,
    node: Arc<NodeDefinition>,
    slot: SharedSlot,
    routine: RoutineFuture,
    primary: String,
    stream: Stream,
    parent: Option<Handle>,
  ) -> Self {
    let mut streams = HashMap::new();
    streams.insert(primary.clone(), stream);
    Self {
      id,
      node,
      primary,
      streams,
      parent,
      pending: PendingRequest::None,
      requested_answered: None,
      fork_count: 0,
      slot,
      routine: Some(routine),
      cursors: HashMap::new(),
      counts: HashMap::new(),
      ended_inputs: HashSet::new(),
      started: false,
      stopped: false,
    }
  }

  pub fn primary_handle(&self) -> Handle {
    self.streams[&self.primary].handle().clone()
  }

  pub fn primary_stream(&self) -> &Stream {
    &self.streams[&self.primary]
  }

  pub fn primary_stream_mut(&mut self) -> &mut Stream {
    self.streams.get_mut(&self.primary).expect("primary stream")
  }

  /// Resume the routine with `reply` and run it to its next suspension.
  ///
  /// The first resume primes the routine; the reply value is discarded
  /// because nothing was requested yet. A `Pending` poll that left no
  /// request in the slot means the routine awaited a future the engine
  /// does not own — fatal.
  pub fn resume(&mut self, reply: Reply) -> Result<Step, EngineError> {
    if self.stopped {
      return Err(EngineError::Protocol {
        node: self.node.key().to_string(),
        message: "resumed a finished driver".to_string(),
      });
    }
    if self.started {
      self.slot.borrow_mut().put_reply(reply);
    } else {
      self.started = true;
    }

    let routine = self.routine.as_mut().ok_or_else(|| EngineError::Protocol {
      node: self.node.key().to_string(),
      message: "driver has no routine".to_string(),
    })?;
    let mut cx = Context::from_waker(noop_waker_ref());
    match routine.as_mut().poll(&mut cx) {
      Poll::Ready(result) => {
        self.stopped = true;
        self.routine = None;
        Ok(Step::Done(result))
      }
      Poll::Pending => match self.slot.borrow_mut().take_request() {
        Some(request) => Ok(Step::Yielded(request)),
        None => Err(EngineError::ForeignAwait {
          node: self.node.key().to_string(),
        }),
      },
    }
  }

  /// Drop the routine future, releasing whatever it holds.
  pub fn drop_routine(&mut self) {
    self.routine = None;
    self.stopped = true;
  }

  /// The index this consumer wants next from `handle`.
  pub fn next_idx(&self, handle: &Handle) -> i64 {
    self.cursors.get(handle).copied().unwrap_or(0)
  }

  /// True once this consumer has observed the end of `handle`.
  pub fn input_ended(&self, handle: &Handle) -> bool {
    self.ended_inputs.contains(handle)
  }

  /// Running per-consumer message count for `handle`.
  pub fn count(&self, handle: &Handle) -> u64 {
    self.counts.get(handle).copied().unwrap_or(0)
  }

  /// Consume one delivered message, advancing the cursor and count.
  pub fn accept_msg(&mut self, handle: &Handle, msg: &Msg) -> PullReply {
    match &msg.data {
      MsgData::Payload(value) => {
        *self.cursors.entry(handle.clone()).or_insert(0) += 1;
        let count = self.counts.entry(handle.clone()).or_insert(0);
        *count += 1;
        PullReply {
          item: Some(Item::Value(value.clone())),
          count: *count,
        }
      }
      MsgData::Handle(info) => {
        *self.cursors.entry(handle.clone()).or_insert(0) += 1;
        let count = self.counts.entry(handle.clone()).or_insert(0);
        *count += 1;
        PullReply {
          item: Some(Item::Stream(info.clone())),
          count: *count,
        }
      }
      MsgData::End => {
        self.ended_inputs.insert(handle.clone());
        PullReply {
          item: None,
          count: self.count(handle),
        }
      }
    }
  }
}
