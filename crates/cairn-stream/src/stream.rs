//! Bounded replay caches.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::PathBuf;

use tracing::debug;

use crate::error::StreamError;
use crate::handle::{Handle, HandleInfo, Header};
use crate::msg::{Msg, MsgData};

/// Default number of messages a stream keeps replayable.
pub const DEFAULT_CACHE_SIZE: usize = 50;

/// Durable backing for a persistent stream.
///
/// Implemented by the store crate; the engine appends every message as it is
/// cached, seals the backing when the stream ends, and commits once the
/// owning node's output is complete.
pub trait Persistence {
  /// Append one message to durable storage.
  fn append(&mut self, msg: &Msg) -> io::Result<()>;

  /// Allocate a fresh artifact path inside the staging area.
  fn make_file(&mut self, name: &str) -> io::Result<PathBuf>;

  /// Flush and fsync buffered messages.
  ///
  /// Publishing the whole staged node output is the store's concern and
  /// happens through its staging handle, after every stream has sealed.
  fn seal(&mut self) -> io::Result<()>;
}

/// Result of a non-blocking cache read.
#[derive(Debug, Clone)]
pub enum GetMsg {
  /// The message is cached.
  Cached(Msg),
  /// The producer has not yet appended this index; the caller must wait.
  Pending,
}

/// A bounded, append-only cache of the most recent messages of one handle.
///
/// Mutated only by its owning driver; read by any number of consumers. The
/// announcement is retained outside the ring so late consumers can always
/// resolve the handle, no matter how far the ring has advanced.
pub struct Stream {
  handle: Handle,
  group: bool,
  info: Option<HandleInfo>,
  cache: VecDeque<Msg>,
  capacity: usize,
  next_idx: i64,
  ended: bool,
  sealed: bool,
  end_pending: bool,
  children: Vec<String>,
  children_expected: HashSet<String>,
  children_sealed: HashSet<String>,
  persistence: Option<Box<dyn Persistence>>,
}

impl Stream {
  pub fn new(handle: Handle, group: bool, capacity: usize) -> Self {
    Self {
      handle,
      group,
      info: None,
      cache: VecDeque::new(),
      capacity,
      next_idx: 0,
      ended: false,
      sealed: false,
      end_pending: false,
      children: Vec::new(),
      children_expected: HashSet::new(),
      children_sealed: HashSet::new(),
      persistence: None,
    }
  }

  /// Attach a durable backing, making this a persistent stream.
  pub fn with_persistence(mut self, persistence: Box<dyn Persistence>) -> Self {
    self.persistence = Some(persistence);
    self
  }

  pub fn handle(&self) -> &Handle {
    &self.handle
  }

  pub fn group(&self) -> bool {
    self.group
  }

  pub fn is_persistent(&self) -> bool {
    self.persistence.is_some()
  }

  /// The announcement, once the stream has been announced.
  pub fn info(&self) -> Option<&HandleInfo> {
    self.info.as_ref()
  }

  pub fn is_announced(&self) -> bool {
    self.info.is_some()
  }

  pub fn ended(&self) -> bool {
    self.ended
  }

  pub fn sealed(&self) -> bool {
    self.sealed
  }

  /// Index of the most recently appended message, `-1` right after the
  /// announcement.
  pub fn latest_idx(&self) -> i64 {
    self.next_idx - 1
  }

  /// Announce the stream, fixing its header forever.
  ///
  /// Returns the announcement message for delivery to waiting consumers.
  pub fn announce(&mut self, header: Header) -> Result<Msg, StreamError> {
    if self.info.is_some() {
      return Err(StreamError::AlreadyAnnounced {
        handle: self.handle.clone(),
      });
    }
    let info = HandleInfo {
      handle: self.handle.clone(),
      group: self.group,
      header,
    };
    let msg = Msg {
      idx: -1,
      handle: self.handle.clone(),
      data: MsgData::Handle(info.clone()),
    };
    if let Some(persistence) = &mut self.persistence {
      persistence.append(&msg)?;
    }
    self.info = Some(info);
    Ok(msg)
  }

  /// Append the next message, assigning its index.
  ///
  /// Evicts the oldest cached entry once the ring is full. The terminal
  /// [`MsgData::End`] marks the stream ended; appending past it fails.
  pub fn push(&mut self, data: MsgData) -> Result<Msg, StreamError> {
    if self.info.is_none() {
      return Err(StreamError::NotAnnounced {
        handle: self.handle.clone(),
      });
    }
    if self.ended {
      return Err(StreamError::AlreadyEnded {
        handle: self.handle.clone(),
      });
    }
    let msg = Msg {
      idx: self.next_idx,
      handle: self.handle.clone(),
      data,
    };
    if let Some(persistence) = &mut self.persistence {
      persistence.append(&msg)?;
    }
    self.next_idx += 1;
    if msg.is_end() {
      self.ended = true;
    }
    self.cache.push_back(msg.clone());
    if self.cache.len() > self.capacity {
      self.cache.pop_front();
    }
    Ok(msg)
  }

  /// Append the terminal end message.
  pub fn end(&mut self) -> Result<Msg, StreamError> {
    self.push(MsgData::End)
  }

  /// The retained window: the announcement plus every message still in the
  /// ring, oldest first.
  pub fn cached(&self) -> Vec<Msg> {
    let mut msgs = Vec::with_capacity(self.cache.len() + 1);
    if let Some(info) = &self.info {
      msgs.push(Msg {
        idx: -1,
        handle: self.handle.clone(),
        data: MsgData::Handle(info.clone()),
      });
    }
    msgs.extend(self.cache.iter().cloned());
    msgs
  }

  /// Read a cached message without blocking or mutating.
  pub fn get_msg(&self, idx: i64) -> Result<GetMsg, StreamError> {
    if idx == -1 {
      return Ok(match &self.info {
        Some(info) => GetMsg::Cached(Msg {
          idx: -1,
          handle: self.handle.clone(),
          data: MsgData::Handle(info.clone()),
        }),
        None => GetMsg::Pending,
      });
    }
    if idx >= self.next_idx {
      return Ok(GetMsg::Pending);
    }
    let oldest = self.next_idx - self.cache.len() as i64;
    if idx < oldest {
      return Err(StreamError::RequestedMessageTooOld {
        handle: self.handle.clone(),
        idx,
        oldest,
      });
    }
    Ok(GetMsg::Cached(self.cache[(idx - oldest) as usize].clone()))
  }

  /// Allocate an output artifact path. Volatile streams do not support this.
  pub fn make_file(&mut self, name: &str) -> Result<PathBuf, StreamError> {
    match &mut self.persistence {
      Some(persistence) => Ok(persistence.make_file(name)?),
      None => Err(StreamError::MakeFileNotSupported {
        handle: self.handle.clone(),
      }),
    }
  }

  /// Flush the durable backing. A no-op for volatile streams.
  pub fn seal(&mut self) -> Result<(), StreamError> {
    if self.sealed {
      return Ok(());
    }
    if let Some(persistence) = &mut self.persistence {
      persistence.seal()?;
    }
    self.sealed = true;
    debug!(handle = %self.handle, "stream_sealed");
    Ok(())
  }

  // Sub-stream bookkeeping, used by the engine on group streams. A group
  // stream's end and seal wait on every expected child.

  /// Register a sub-stream that has been created but may not yet have
  /// announced itself.
  pub fn expect_child(&mut self, name: &str) {
    self.children_expected.insert(name.to_string());
  }

  /// Record a sub-stream announcement. Returns true if all expected
  /// children have now announced.
  pub fn child_announced(&mut self, name: &str) -> bool {
    if !self.children.iter().any(|c| c == name) {
      self.children.push(name.to_string());
    }
    self.children_expected.remove(name);
    self.children_expected.is_empty()
  }

  /// True while some created sub-stream has not yet announced.
  pub fn has_pending_children(&self) -> bool {
    !self.children_expected.is_empty()
  }

  /// Names of created sub-streams that have not yet announced.
  pub fn pending_children(&self) -> impl Iterator<Item = &str> {
    self.children_expected.iter().map(String::as_str)
  }

  /// Announced sub-stream names, in announcement order.
  pub fn children(&self) -> &[String] {
    &self.children
  }

  /// Record a sealed sub-stream. Returns true once every announced and
  /// expected child has sealed.
  pub fn child_sealed(&mut self, name: &str) -> bool {
    self.children_sealed.insert(name.to_string());
    self.all_children_sealed()
  }

  pub fn all_children_sealed(&self) -> bool {
    self.children_expected.is_empty()
      && self.children.iter().all(|c| self.children_sealed.contains(c))
  }

  /// Defer the end message until all expected children have announced.
  pub fn set_end_pending(&mut self) {
    self.end_pending = true;
  }

  pub fn end_pending(&self) -> bool {
    self.end_pending
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::setid::Setid;
  use serde_json::json;

  fn stream(capacity: usize) -> Stream {
    let handle = Handle::new(Setid::from_u128(9), "scans-0011223344556677", "scans");
    Stream::new(handle, false, capacity)
  }

  #[test]
  fn test_idx_sequence_is_gap_free() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    let announce = s.announce(Header::new()).unwrap();
    assert_eq!(announce.idx, -1);
    for i in 0..5 {
      let msg = s.push(MsgData::Payload(json!(i))).unwrap();
      assert_eq!(msg.idx, i);
    }
    let end = s.end().unwrap();
    assert_eq!(end.idx, 5);
    assert!(s.ended());
  }

  #[test]
  fn test_push_before_announce_fails() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    assert!(matches!(
      s.push(MsgData::Payload(json!(1))),
      Err(StreamError::NotAnnounced { .. })
    ));
  }

  #[test]
  fn test_push_after_end_fails() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    s.announce(Header::new()).unwrap();
    s.end().unwrap();
    assert!(matches!(
      s.push(MsgData::Payload(json!(1))),
      Err(StreamError::AlreadyEnded { .. })
    ));
  }

  #[test]
  fn test_announce_twice_fails() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    s.announce(Header::new()).unwrap();
    assert!(matches!(
      s.announce(Header::new()),
      Err(StreamError::AlreadyAnnounced { .. })
    ));
  }

  #[test]
  fn test_eviction_and_too_old() {
    let mut s = stream(4);
    s.announce(Header::new()).unwrap();
    for i in 0..10 {
      s.push(MsgData::Payload(json!(i))).unwrap();
    }
    // Window is [6, 9]; 5 fell out of the ring.
    match s.get_msg(6).unwrap() {
      GetMsg::Cached(msg) => assert_eq!(msg.payload(), Some(&json!(6))),
      GetMsg::Pending => panic!("expected cached message"),
    }
    let err = s.get_msg(5).unwrap_err();
    assert!(matches!(
      err,
      StreamError::RequestedMessageTooOld { idx: 5, oldest: 6, .. }
    ));
  }

  #[test]
  fn test_announcement_survives_eviction() {
    let mut s = stream(2);
    s.announce(Header::new().with("topic", json!("/imu"))).unwrap();
    for i in 0..20 {
      s.push(MsgData::Payload(json!(i))).unwrap();
    }
    match s.get_msg(-1).unwrap() {
      GetMsg::Cached(msg) => assert!(msg.is_announcement()),
      GetMsg::Pending => panic!("announcement must stay resolvable"),
    }
  }

  #[test]
  fn test_get_future_idx_is_pending() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    s.announce(Header::new()).unwrap();
    s.push(MsgData::Payload(json!(0))).unwrap();
    assert!(matches!(s.get_msg(1).unwrap(), GetMsg::Pending));
  }

  #[test]
  fn test_make_file_on_volatile_fails() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    assert!(matches!(
      s.make_file("plot.png"),
      Err(StreamError::MakeFileNotSupported { .. })
    ));
  }

  #[test]
  fn test_child_bookkeeping() {
    let mut s = stream(DEFAULT_CACHE_SIZE);
    s.expect_child("0");
    s.expect_child("1");
    assert!(s.has_pending_children());
    assert!(!s.child_announced("0"));
    assert!(s.child_announced("1"));
    assert!(!s.all_children_sealed());
    s.child_sealed("0");
    assert!(s.child_sealed("1"));
    assert!(s.all_children_sealed());
  }
}
