//! The routine-facing request protocol.
//!
//! A routine communicates with the engine exclusively through
//! [`TaskContext`]. Each method deposits a [`Request`] into the shared slot
//! and suspends; the driver picks the request up, the scheduler acts on it,
//! and the driver resumes the routine by depositing the matching [`Reply`].
//! A routine therefore suspends at exactly these calls and nowhere else.

use std::cell::RefCell;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;

use cairn_stream::{Handle, HandleInfo, Header};

use crate::error::NodeError;
use crate::input::InputValue;
use crate::node::NodeDefinition;

/// A request yielded by a routine to the engine.
#[derive(Debug)]
pub enum Request {
  /// Wait for the next message on a handle. With `enumerate`, the reply
  /// carries the running per-consumer message count.
  Pull { handle: Handle, enumerate: bool },
  /// Wait until the next message on every listed handle is available
  /// (barrier join); the reply preserves handle order.
  PullAll { handles: Vec<Handle> },
  /// Append a payload to one of this node's own streams (`None` = the
  /// primary stream).
  Push { stream: Option<String>, value: Value },
  /// Fix the primary stream's header and announce the handle. Must precede
  /// any push or sub-stream creation.
  SetHeader { header: Header },
  /// Create and announce a named sub-stream. Only legal on group nodes.
  CreateStream {
    name: String,
    group: bool,
    header: Header,
  },
  /// Spawn a new driver as a sub-stream of this node.
  Fork {
    name: String,
    overrides: Vec<(String, InputValue)>,
  },
  /// Resolve (possibly instantiating) another node's stream without
  /// consuming messages. `None` resolves the default stream.
  GetStream {
    node: Arc<NodeDefinition>,
    name: Option<String>,
  },
  /// Wait for the stable set of sub-stream names demanded downstream.
  /// Only legal on on-demand group nodes.
  GetRequested,
  /// Allocate an output artifact path. Only legal on persistent streams.
  MakeFile { name: String },
}

impl Request {
  /// Short name for diagnostics.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Pull { .. } => "pull",
      Self::PullAll { .. } => "pull_all",
      Self::Push { .. } => "push",
      Self::SetHeader { .. } => "set_header",
      Self::CreateStream { .. } => "create_stream",
      Self::Fork { .. } => "fork",
      Self::GetStream { .. } => "get_stream",
      Self::GetRequested => "get_requested",
      Self::MakeFile { .. } => "make_file",
    }
  }
}

/// One delivered message as a routine sees it.
#[derive(Debug, Clone)]
pub enum Item {
  /// A payload value.
  Value(Value),
  /// A nested sub-stream announcement (group streams only).
  Stream(HandleInfo),
}

impl Item {
  pub fn into_value(self) -> Option<Value> {
    match self {
      Self::Value(value) => Some(value),
      Self::Stream(_) => None,
    }
  }

  pub fn as_stream(&self) -> Option<&HandleInfo> {
    match self {
      Self::Stream(info) => Some(info),
      Self::Value(_) => None,
    }
  }
}

/// Reply to a single pull. `item` is `None` once the stream has ended.
#[derive(Debug, Clone)]
pub struct PullReply {
  pub item: Option<Item>,
  pub count: u64,
}

/// A reply resumed into a routine.
#[derive(Debug)]
pub enum Reply {
  /// Generic acknowledgement / wake-up.
  Ack,
  Pull(PullReply),
  Batch(Vec<PullReply>),
  Stream(HandleInfo),
  Requested(Vec<String>),
  Path(PathBuf),
  /// An engine-side failure delivered into the routine, which is expected
  /// to propagate it.
  Err(NodeError),
}

/// The single-entry mailbox between a routine and its driver.
#[derive(Default)]
pub struct Slot {
  request: Option<Request>,
  reply: Option<Reply>,
}

impl Slot {
  pub fn shared() -> SharedSlot {
    Rc::new(RefCell::new(Slot::default()))
  }

  /// Remove the request the routine just yielded, if any.
  pub fn take_request(&mut self) -> Option<Request> {
    self.request.take()
  }

  /// Deposit the reply the routine will resume with.
  pub fn put_reply(&mut self, reply: Reply) {
    self.reply = Some(reply);
  }
}

pub type SharedSlot = Rc<RefCell<Slot>>;

/// The protocol endpoint handed to a running routine.
#[derive(Clone)]
pub struct TaskContext {
  slot: SharedSlot,
}

impl TaskContext {
  pub fn new(slot: SharedSlot) -> Self {
    Self { slot }
  }

  fn call(&self, request: Request) -> RequestFuture {
    self.slot.borrow_mut().request = Some(request);
    RequestFuture {
      slot: self.slot.clone(),
    }
  }

  /// Pull the next message from a handle. `None` means the stream ended.
  pub async fn pull(&self, handle: &Handle) -> Result<Option<Item>, NodeError> {
    match self
      .call(Request::Pull {
        handle: handle.clone(),
        enumerate: false,
      })
      .await
    {
      Reply::Pull(reply) => Ok(reply.item),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "pull" }),
    }
  }

  /// Pull with the running per-consumer message count.
  pub async fn pull_enumerated(
    &self,
    handle: &Handle,
  ) -> Result<Option<(u64, Item)>, NodeError> {
    match self
      .call(Request::Pull {
        handle: handle.clone(),
        enumerate: true,
      })
      .await
    {
      Reply::Pull(reply) => Ok(reply.item.map(|item| (reply.count, item))),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "pull_enumerated" }),
    }
  }

  /// Barrier join: wait for the next message on every handle.
  ///
  /// The outer `None` means every stream has ended. Within the list, a
  /// `None` slot marks a stream that ended while others continue; slots
  /// keep handle order and the list is never partial.
  pub async fn pull_all(
    &self,
    handles: &[Handle],
  ) -> Result<Option<Vec<Option<Item>>>, NodeError> {
    match self
      .call(Request::PullAll {
        handles: handles.to_vec(),
      })
      .await
    {
      Reply::Batch(replies) => {
        if replies.iter().all(|r| r.item.is_none()) {
          return Ok(None);
        }
        Ok(Some(replies.into_iter().map(|r| r.item).collect()))
      }
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "pull_all" }),
    }
  }

  /// Append a payload to this node's primary stream.
  pub async fn push(&self, value: Value) -> Result<(), NodeError> {
    match self.call(Request::Push { stream: None, value }).await {
      Reply::Ack => Ok(()),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "push" }),
    }
  }

  /// Append a payload to one of this node's named sub-streams.
  pub async fn push_to(&self, stream: &str, value: Value) -> Result<(), NodeError> {
    match self
      .call(Request::Push {
        stream: Some(stream.to_string()),
        value,
      })
      .await
    {
      Reply::Ack => Ok(()),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "push_to" }),
    }
  }

  /// Fix the primary stream's header and announce it.
  pub async fn set_header(&self, header: Header) -> Result<(), NodeError> {
    match self.call(Request::SetHeader { header }).await {
      Reply::Ack => Ok(()),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "set_header" }),
    }
  }

  /// Create and announce a named sub-stream (group nodes only).
  pub async fn create_stream(
    &self,
    name: &str,
    group: bool,
    header: Header,
  ) -> Result<HandleInfo, NodeError> {
    match self
      .call(Request::CreateStream {
        name: name.to_string(),
        group,
        header,
      })
      .await
    {
      Reply::Stream(info) => Ok(info),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "create_stream" }),
    }
  }

  /// Spawn a new driver under `name` with the given input overrides.
  pub async fn fork(
    &self,
    name: &str,
    overrides: Vec<(String, InputValue)>,
  ) -> Result<(), NodeError> {
    match self
      .call(Request::Fork {
        name: name.to_string(),
        overrides,
      })
      .await
    {
      Reply::Ack => Ok(()),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "fork" }),
    }
  }

  /// Resolve another node's stream, waiting for its announcement but
  /// consuming nothing.
  pub async fn get_stream(
    &self,
    node: &Arc<NodeDefinition>,
    name: Option<&str>,
  ) -> Result<HandleInfo, NodeError> {
    match self
      .call(Request::GetStream {
        node: node.clone(),
        name: name.map(str::to_string),
      })
      .await
    {
      Reply::Stream(info) => Ok(info),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "get_stream" }),
    }
  }

  /// Wait for the stable set of demanded sub-stream names (on-demand group
  /// nodes only).
  pub async fn get_requested(&self) -> Result<Vec<String>, NodeError> {
    match self.call(Request::GetRequested).await {
      Reply::Requested(names) => Ok(names),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "get_requested" }),
    }
  }

  /// Allocate an output artifact path on this node's persistent stream.
  pub async fn make_file(&self, name: &str) -> Result<PathBuf, NodeError> {
    match self
      .call(Request::MakeFile {
        name: name.to_string(),
      })
      .await
    {
      Reply::Path(path) => Ok(path),
      Reply::Err(e) => Err(e),
      _ => Err(NodeError::UnexpectedReply { request: "make_file" }),
    }
  }
}

/// Future that completes once the driver deposits a reply.
struct RequestFuture {
  slot: SharedSlot,
}

impl Future for RequestFuture {
  type Output = Reply;

  fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.slot.borrow_mut().reply.take() {
      Some(reply) => Poll::Ready(reply),
      None => Poll::Pending,
    }
  }
}
