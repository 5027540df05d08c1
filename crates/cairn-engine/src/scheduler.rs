//! The run-loop scheduler.
//!
//! One scheduler owns every driver of one dataset run and multiplexes them
//! on a single control thread. Concurrency between nodes is interleaving of
//! resumable routines; no in-memory state is shared across threads, so no
//! locks guard streams or drivers. The only truly concurrent resource is
//! the on-disk store, which the staging lock protects.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use cairn_node::{
  GroupMode, InputSpec, InputValue, NodeDefinition, NodeError, Reply, Request, ResolvedInputs,
  Slot, TaskContext,
};
use cairn_store::{FsStore, Staging, Store, StoreError};
use cairn_stream::{GetMsg, Handle, Header, Msg, MsgData, Setid, Stream, StreamError};

use crate::config::RunConfig;
use crate::driver::{Driver, DriverId, PendingRequest, Step};
use crate::error::EngineError;
use crate::forker::build_forker;
use crate::report::RunReport;

type SharedStaging = Rc<RefCell<Box<dyn Staging>>>;

/// Staging area of one persisted node, shared by its streams.
struct StagingEntry {
  staging: SharedStaging,
  primary: Handle,
}

/// Where a registered stream lives.
#[derive(Clone)]
struct StreamRef {
  driver: DriverId,
  name: String,
  /// Parent stream handle when this is a sub-stream.
  parent: Option<Handle>,
}

/// Result of trying to serve one message request without suspending.
enum Fetch {
  Ready(Msg),
  Wait,
  Failed(NodeError),
}

/// The cooperative scheduler for one dataset run.
///
/// Owns all drivers, the send queue, the waiting lists, and the
/// backpressure sets. Dependencies are resolved lazily: from a live stream
/// first, then from the store, then by instantiating a producer driver.
pub struct Scheduler {
  setid: Setid,
  config: RunConfig,
  store: Option<Box<dyn Store>>,
  drivers: HashMap<DriverId, Driver>,
  next_driver: u64,
  /// Drivers with a reply ready, in resume order.
  send_queue: VecDeque<(DriverId, Reply)>,
  /// `(handle, idx)` -> drivers blocked on that exact message, FIFO.
  waiting: HashMap<(Handle, i64), Vec<DriverId>>,
  /// Throttled producers with no pending reason to run.
  suspended: BTreeSet<DriverId>,
  /// On-demand drivers paused for the stable demand set.
  paused: BTreeSet<DriverId>,
  /// Drivers whose completion is mandatory for the run to succeed.
  pulling: HashSet<DriverId>,
  done: HashSet<DriverId>,
  /// Every definition seen this run, for lazy materialization.
  registry: HashMap<String, Arc<NodeDefinition>>,
  /// node key -> its live driver.
  node_drivers: HashMap<String, DriverId>,
  stream_owners: HashMap<Handle, StreamRef>,
  /// Full message logs resolved from committed store generations.
  stored: HashMap<Handle, Vec<Msg>>,
  /// node key -> demanded sub-stream names, in demand order.
  requested: HashMap<String, Vec<String>>,
  /// Staging areas keyed by the owning stream node key.
  stagings: HashMap<String, StagingEntry>,
  committed: HashSet<String>,
  report: RunReport,
}

impl Scheduler {
  /// Create a scheduler for one dataset, opening the store when configured.
  pub fn new(setid: Setid, config: RunConfig) -> Result<Self, EngineError> {
    let store: Option<Box<dyn Store>> = match &config.store_root {
      Some(root) => Some(Box::new(FsStore::new(root.clone())?)),
      None => None,
    };
    Ok(Self::with_store(setid, config, store))
  }

  /// Create a scheduler with an explicit store implementation.
  pub fn with_store(setid: Setid, config: RunConfig, store: Option<Box<dyn Store>>) -> Self {
    Self {
      setid,
      config,
      store,
      drivers: HashMap::new(),
      next_driver: 0,
      send_queue: VecDeque::new(),
      waiting: HashMap::new(),
      suspended: BTreeSet::new(),
      paused: BTreeSet::new(),
      pulling: HashSet::new(),
      done: HashSet::new(),
      registry: HashMap::new(),
      node_drivers: HashMap::new(),
      stream_owners: HashMap::new(),
      stored: HashMap::new(),
      requested: HashMap::new(),
      stagings: HashMap::new(),
      committed: HashSet::new(),
      report: RunReport::new(setid),
    }
  }

  pub fn setid(&self) -> Setid {
    self.setid
  }

  /// Execute the requested nodes to completion.
  ///
  /// Teardown (dropping routines, releasing staging locks) runs on every
  /// exit path before the result is returned.
  #[instrument(name = "dataset_run", skip(self, nodes, cancel), fields(setid = %self.setid))]
  pub fn run(
    &mut self,
    nodes: &[Arc<NodeDefinition>],
    cancel: &CancellationToken,
  ) -> Result<RunReport, EngineError> {
    info!(nodes = nodes.len(), "run_started");
    let result = self.run_inner(nodes, cancel);
    self.teardown();
    match result {
      Ok(()) => {
        let report = std::mem::replace(&mut self.report, RunReport::new(self.setid));
        info!(
          finished = report.finished.len(),
          cached = report.cached.len(),
          committed = report.committed.len(),
          "run_completed"
        );
        Ok(report)
      }
      Err(e) => {
        error!(error = %e, "run_failed");
        Err(e)
      }
    }
  }

  fn run_inner(
    &mut self,
    nodes: &[Arc<NodeDefinition>],
    cancel: &CancellationToken,
  ) -> Result<(), EngineError> {
    for node in nodes {
      self.register(node);
      if !self.config.force && self.load_from_store(node)? {
        info!(node = %node.key(), "node_cached");
        self.report.cached.push(node.key().to_string());
        continue;
      }
      let id = self.ensure_driver(node.clone(), None)?;
      self.pulling.insert(id);
    }
    self.run_loop(cancel)
  }

  fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
    loop {
      if cancel.is_cancelled() {
        warn!("run cancelled");
        return Err(EngineError::Cancelled);
      }
      if self.send_queue.is_empty() {
        self.wake_relevant();
      }
      let Some((id, reply)) = self.send_queue.pop_front() else {
        return self.finish_idle();
      };
      // Entries for torn-down drivers are stale, not errors.
      if !self.drivers.contains_key(&id) || self.done.contains(&id) {
        continue;
      }
      let step = self
        .drivers
        .get_mut(&id)
        .expect("driver exists")
        .resume(reply)?;
      match step {
        Step::Yielded(request) => self.dispatch(id, request)?,
        Step::Done(result) => self.finish_driver(id, result)?,
      }
    }
  }

  /// The only "wake everyone and see" fallback: runs when nothing has a
  /// reply queued. Paused on-demand drivers get the now-stable demand set;
  /// throttled producers that something mandatory transitively waits on
  /// are requeued.
  fn wake_relevant(&mut self) {
    let paused: Vec<DriverId> = self.paused.iter().copied().collect();
    for id in paused {
      self.paused.remove(&id);
      let Some(driver) = self.drivers.get_mut(&id) else {
        continue;
      };
      let names = self
        .requested
        .get(driver.node.key())
        .cloned()
        .unwrap_or_default();
      info!(node = %driver.node.key(), names = ?names, "requested_streams");
      driver.requested_answered = Some(names.clone());
      driver.pending = PendingRequest::None;
      self.send_queue.push_back((id, Reply::Requested(names)));
    }
    if !self.send_queue.is_empty() {
      return;
    }

    let relevant = self.relevant_drivers();
    let wake: Vec<DriverId> = self
      .suspended
      .iter()
      .copied()
      .filter(|id| relevant.contains(id))
      .collect();
    for id in wake {
      self.suspended.remove(&id);
      debug!(driver = %id, "driver_woken");
      self.send_queue.push_back((id, Reply::Ack));
    }
  }

  /// Drivers that are transitively relevant to a mandatory driver: walk
  /// from `pulling` along waits-on edges to the drivers that contribute to
  /// each awaited handle.
  fn relevant_drivers(&self) -> HashSet<DriverId> {
    let mut waits: HashMap<DriverId, Vec<Handle>> = HashMap::new();
    for ((handle, _), waiters) in &self.waiting {
      for waiter in waiters {
        waits.entry(*waiter).or_default().push(handle.clone());
      }
    }

    let mut relevant: HashSet<DriverId> = self.pulling.iter().copied().collect();
    let mut frontier: Vec<DriverId> = relevant.iter().copied().collect();
    while let Some(id) = frontier.pop() {
      let Some(handles) = waits.get(&id) else {
        continue;
      };
      for handle in handles {
        for contributor in self.contributors(handle) {
          if relevant.insert(contributor) {
            frontier.push(contributor);
          }
        }
      }
    }
    relevant
  }

  /// Drivers that can make progress on a handle: its owner, plus the
  /// drivers of created-but-unannounced children (a group stream's end
  /// waits on them).
  fn contributors(&self, handle: &Handle) -> Vec<DriverId> {
    let mut out = Vec::new();
    if let Some(stream_ref) = self.stream_owners.get(handle) {
      out.push(stream_ref.driver);
      if let Some(stream) = self.stream(handle) {
        for child in stream.pending_children() {
          if let Some(child_ref) = self.stream_owners.get(&handle.sub(child)) {
            out.push(child_ref.driver);
          }
        }
      }
    } else if let Some(&id) = self.node_drivers.get(&handle.node) {
      out.push(id);
    }
    out
  }

  /// The run went idle. A blocked mandatory driver is a hard failure
  /// naming the handle it needs; throttled dependencies abandoned
  /// mid-flight are discarded silently — they were never demanded to
  /// finish.
  fn finish_idle(&mut self) -> Result<(), EngineError> {
    let mut blocked: Vec<(DriverId, Handle, i64)> = Vec::new();
    for ((handle, idx), waiters) in &self.waiting {
      for waiter in waiters {
        blocked.push((*waiter, handle.clone(), *idx));
      }
    }
    blocked.sort_by(|a, b| a.0.cmp(&b.0));
    for (id, handle, idx) in &blocked {
      if self.pulling.contains(id) {
        let node = self
          .drivers
          .get(id)
          .map(|d| d.node.key().to_string())
          .unwrap_or_default();
        return Err(EngineError::UnfinishedDriver {
          node,
          handle: handle.clone(),
          idx: *idx,
        });
      }
    }

    // A mandatory driver that is neither finished nor blocked has no wake
    // path left; nothing legitimate produces that state.
    let stuck: Vec<DriverId> = self
      .pulling
      .iter()
      .copied()
      .filter(|id| !self.done.contains(id) && !blocked.iter().any(|(b, _, _)| b == id))
      .collect();
    if !stuck.is_empty() {
      return Err(EngineError::InconsistentState {
        message: format!("{} mandatory drivers idle mid-flight", stuck.len()),
      });
    }

    if !blocked.is_empty() {
      debug!(
        abandoned = blocked.len(),
        "dropping throttled dependency waits at idle"
      );
    }
    Ok(())
  }

  // ---- dispatch ----------------------------------------------------------

  fn dispatch(&mut self, id: DriverId, request: Request) -> Result<(), EngineError> {
    match request {
      Request::SetHeader { header } => {
        if self.drivers[&id].primary_stream().is_announced() {
          let handle = self.drivers[&id].primary_handle();
          self.reply_err(id, NodeError::Stream(StreamError::AlreadyAnnounced { handle }));
          return Ok(());
        }
        self.announce_primary(id, header)?;
        self.after_produce(id);
        Ok(())
      }
      Request::Push { stream, value } => self.handle_push(id, stream, value),
      Request::Pull { handle, enumerate: _ } => {
        self
          .drivers
          .get_mut(&id)
          .expect("driver exists")
          .pending = PendingRequest::Pull { handle };
        self.begin_pull(id)
      }
      Request::PullAll { handles } => {
        let slots = handles.len();
        self
          .drivers
          .get_mut(&id)
          .expect("driver exists")
          .pending = PendingRequest::PullAll {
          handles,
          replies: vec![None; slots],
        };
        self.begin_pull(id)
      }
      Request::CreateStream {
        name,
        group,
        header,
      } => self.handle_create_stream(id, name, group, header),
      Request::Fork { name, overrides } => self.handle_fork(id, name, overrides),
      Request::GetStream { node, name } => self.handle_get_stream(id, node, name),
      Request::GetRequested => {
        if self.drivers[&id].node.group() != GroupMode::OnDemand {
          self.reply_err(
            id,
            NodeError::Protocol("get_requested outside an on-demand group node".to_string()),
          );
          return Ok(());
        }
        self
          .drivers
          .get_mut(&id)
          .expect("driver exists")
          .pending = PendingRequest::Requested;
        self.paused.insert(id);
        debug!(driver = %id, "driver_paused");
        Ok(())
      }
      Request::MakeFile { name } => {
        let result = self
          .drivers
          .get_mut(&id)
          .expect("driver exists")
          .primary_stream_mut()
          .make_file(&name);
        match result {
          Ok(path) => self.send_queue.push_back((id, Reply::Path(path))),
          Err(e) => self.reply_err(id, NodeError::Stream(e)),
        }
        Ok(())
      }
    }
  }

  fn handle_push(
    &mut self,
    id: DriverId,
    stream: Option<String>,
    value: Value,
  ) -> Result<(), EngineError> {
    let primary = self.drivers[&id].primary.clone();
    let name = stream.unwrap_or_else(|| primary.clone());
    if name == primary && !self.drivers[&id].primary_stream().is_announced() {
      // First push finalizes the announcement with an empty header.
      self.announce_primary(id, Header::new())?;
    }
    if !self.drivers[&id].streams.contains_key(&name) {
      self.reply_err(
        id,
        NodeError::Protocol(format!("push to unknown stream '{name}'")),
      );
      return Ok(());
    }
    let (handle, msg) = {
      let driver = self.drivers.get_mut(&id).expect("driver exists");
      let stream = driver.streams.get_mut(&name).expect("checked above");
      let msg = stream.push(MsgData::Payload(value))?;
      (stream.handle().clone(), msg)
    };
    self.deliver(&handle, &msg)?;
    self.after_produce(id);
    Ok(())
  }

  fn handle_create_stream(
    &mut self,
    id: DriverId,
    name: String,
    group: bool,
    header: Header,
  ) -> Result<(), EngineError> {
    let node = self.drivers[&id].node.clone();
    if node.group() == GroupMode::None && !node.has_foreach() {
      self.reply_err(
        id,
        NodeError::Protocol("create_stream on a non-group node".to_string()),
      );
      return Ok(());
    }
    if self.drivers[&id].streams.contains_key(&name) {
      self.reply_err(
        id,
        NodeError::Protocol(format!("stream '{name}' already exists")),
      );
      return Ok(());
    }
    if !self.drivers[&id].primary_stream().is_announced() {
      self.announce_primary(id, Header::new())?;
    }

    let parent_handle = self.drivers[&id].primary_handle();
    let handle = parent_handle.sub(name.clone());
    let mut stream = Stream::new(handle.clone(), group, self.config.cache_size);
    if let Some(entry) = self.stagings.get(&handle.node) {
      let persistence = entry.staging.borrow_mut().create_stream(&name)?;
      stream = stream.with_persistence(persistence);
    }
    {
      let driver = self.drivers.get_mut(&id).expect("driver exists");
      driver.primary_stream_mut().expect_child(&name);
      driver.streams.insert(name.clone(), stream);
    }
    self.stream_owners.insert(
      handle.clone(),
      StreamRef {
        driver: id,
        name: name.clone(),
        parent: Some(parent_handle),
      },
    );
    self.announce_stream(id, &name, header)?;
    let info = self
      .stream(&handle)
      .and_then(|s| s.info().cloned())
      .expect("just announced");
    self.send_queue.push_back((id, Reply::Stream(info)));
    Ok(())
  }

  fn handle_fork(
    &mut self,
    id: DriverId,
    name: String,
    overrides: Vec<(String, InputValue)>,
  ) -> Result<(), EngineError> {
    if !self.drivers[&id].primary_stream().is_announced() {
      self.announce_primary(id, Header::new())?;
    }
    let node = self.drivers[&id].node.clone();
    let specs: Vec<(String, InputSpec)> = overrides
      .into_iter()
      .map(|(input, value)| {
        let spec = match value {
          InputValue::Value(v) => InputSpec::Value(v),
          InputValue::Stream(h) => InputSpec::Handle(h),
        };
        (input, spec)
      })
      .collect();
    let child = match node.clone_with(specs) {
      Ok(child) => child,
      Err(e) => {
        self.reply_err(id, e);
        return Ok(());
      }
    };

    // Identical resolved inputs deduplicate to the one existing sub-task.
    if self.node_drivers.contains_key(child.key()) {
      debug!(node = %node.key(), fork = %name, "fork_deduplicated");
      self.send_queue.push_back((id, Reply::Ack));
      return Ok(());
    }

    {
      let driver = self.drivers.get_mut(&id).expect("driver exists");
      driver.primary_stream_mut().expect_child(&name);
      driver.fork_count += 1;
    }
    let child_id = self.ensure_driver(child.clone(), Some((id, name.clone())))?;
    // The must-complete property is transitive through forks of mandatory
    // drivers; incidental dependencies stay throttled.
    if self.pulling.contains(&id) {
      self.pulling.insert(child_id);
    }
    info!(node = %node.key(), fork = %name, child = %child.key(), "node_forked");
    self.send_queue.push_back((id, Reply::Ack));
    Ok(())
  }

  fn handle_get_stream(
    &mut self,
    id: DriverId,
    node: Arc<NodeDefinition>,
    name: Option<String>,
  ) -> Result<(), EngineError> {
    self.register(&node);
    let stream_name = name.unwrap_or_else(|| node.name().to_string());
    let handle = Handle::new(self.setid, node.key().to_string(), stream_name.clone());
    if stream_name != node.name() {
      self.demand_substream(node.key().to_string(), &stream_name)?;
    }

    if let Some(info) = self.announced_info(&handle) {
      self.send_queue.push_back((id, Reply::Stream(info)));
      return Ok(());
    }
    self.ensure_producer(&handle, id)?;
    if let Some(info) = self.announced_info(&handle) {
      self.send_queue.push_back((id, Reply::Stream(info)));
      return Ok(());
    }

    self
      .drivers
      .get_mut(&id)
      .expect("driver exists")
      .pending = PendingRequest::GetStream {
      handle: handle.clone(),
    };
    self.waiting.entry((handle, -1)).or_default().push(id);
    Ok(())
  }

  /// The announcement of a handle, live or stored, if it exists yet.
  fn announced_info(&self, handle: &Handle) -> Option<cairn_stream::HandleInfo> {
    if let Some(info) = self.stream(handle).and_then(|s| s.info().cloned()) {
      return Some(info);
    }
    match self.stored.get(handle)?.first()?.data {
      MsgData::Handle(ref info) => Some(info.clone()),
      _ => None,
    }
  }

  // ---- pulls -------------------------------------------------------------

  /// Try to serve the driver's pending pull(s) immediately; register waits
  /// for everything not yet produced. After this, slots fill exclusively
  /// through message delivery.
  fn begin_pull(&mut self, id: DriverId) -> Result<(), EngineError> {
    let handles: Vec<Handle> = match &self.drivers[&id].pending {
      PendingRequest::Pull { handle } => vec![handle.clone()],
      PendingRequest::PullAll { handles, .. } => handles.clone(),
      _ => return Ok(()),
    };

    for handle in handles {
      if self.drivers[&id].input_ended(&handle) {
        let idx = self.drivers[&id].next_idx(&handle);
        let end = Msg {
          idx,
          handle: handle.clone(),
          data: MsgData::End,
        };
        self.satisfy_waiter(id, &handle, &end)?;
        continue;
      }
      let idx = self.drivers[&id].next_idx(&handle);
      match self.fetch_msg(&handle, idx, id)? {
        Fetch::Ready(msg) => self.satisfy_waiter(id, &handle, &msg)?,
        Fetch::Wait => {
          debug!(driver = %id, handle = %handle, idx, "driver_waiting");
          self
            .waiting
            .entry((handle.clone(), idx))
            .or_default()
            .push(id);
        }
        Fetch::Failed(e) => {
          self.drivers.get_mut(&id).expect("driver exists").pending = PendingRequest::None;
          self.reply_err(id, e);
          return Ok(());
        }
      }
    }
    Ok(())
  }

  /// Serve `(handle, idx)` from a live stream, the store, or by lazily
  /// materializing a producer.
  fn fetch_msg(
    &mut self,
    handle: &Handle,
    idx: i64,
    requester: DriverId,
  ) -> Result<Fetch, EngineError> {
    if let Some(stream) = self.stream(handle) {
      return Ok(match stream.get_msg(idx) {
        Ok(GetMsg::Cached(msg)) => Fetch::Ready(msg),
        Ok(GetMsg::Pending) => Fetch::Wait,
        Err(e) => Fetch::Failed(NodeError::Stream(e)),
      });
    }
    if let Some(fetch) = self.fetch_stored(handle, idx)? {
      return Ok(fetch);
    }
    self.ensure_producer(handle, requester)?;
    if let Some(fetch) = self.fetch_stored(handle, idx)? {
      return Ok(fetch);
    }
    Ok(Fetch::Wait)
  }

  fn fetch_stored(&self, handle: &Handle, idx: i64) -> Result<Option<Fetch>, EngineError> {
    let Some(msgs) = self.stored.get(handle) else {
      return Ok(None);
    };
    match msgs.get((idx + 1) as usize) {
      Some(msg) => Ok(Some(Fetch::Ready(msg.clone()))),
      None => Err(EngineError::InconsistentState {
        message: format!("stored stream {handle} has no message {idx}"),
      }),
    }
  }

  /// Deliver one appended message to every driver waiting on it.
  fn deliver(&mut self, handle: &Handle, msg: &Msg) -> Result<(), EngineError> {
    if let Some(waiters) = self.waiting.remove(&(handle.clone(), msg.idx)) {
      for waiter in waiters {
        self.satisfy_waiter(waiter, handle, msg)?;
      }
    }
    Ok(())
  }

  /// Route a delivered message into the waiter's pending request, queueing
  /// the reply once it is complete.
  fn satisfy_waiter(
    &mut self,
    id: DriverId,
    handle: &Handle,
    msg: &Msg,
  ) -> Result<(), EngineError> {
    let Some(driver) = self.drivers.get_mut(&id) else {
      return Ok(());
    };
    let pending = std::mem::replace(&mut driver.pending, PendingRequest::None);
    match pending {
      PendingRequest::Pull { handle: wanted } if wanted == *handle => {
        let reply = driver.accept_msg(handle, msg);
        self.send_queue.push_back((id, Reply::Pull(reply)));
      }
      PendingRequest::PullAll {
        handles,
        mut replies,
      } => {
        let mut slot = None;
        for (i, h) in handles.iter().enumerate() {
          if h == handle && replies[i].is_none() {
            slot = Some(i);
            break;
          }
        }
        if let Some(slot) = slot {
          replies[slot] = Some(driver.accept_msg(handle, msg));
        }
        if replies.iter().all(|r| r.is_some()) {
          let batch = replies.into_iter().flatten().collect();
          self.send_queue.push_back((id, Reply::Batch(batch)));
        } else {
          driver.pending = PendingRequest::PullAll { handles, replies };
        }
      }
      PendingRequest::GetStream { handle: wanted } if wanted == *handle => match &msg.data {
        MsgData::Handle(info) => {
          self.send_queue.push_back((id, Reply::Stream(info.clone())));
        }
        _ => {
          return Err(EngineError::InconsistentState {
            message: format!("expected an announcement on {handle}"),
          });
        }
      },
      other => {
        // Stale wake; leave the pending request as it was.
        driver.pending = other;
      }
    }
    Ok(())
  }

  // ---- producers, streams, persistence -----------------------------------

  /// Make sure something will eventually produce `handle`: a live stream,
  /// a committed generation, or a freshly materialized driver.
  fn ensure_producer(&mut self, handle: &Handle, requester: DriverId) -> Result<(), EngineError> {
    if self.stream_owners.contains_key(handle) || self.stored.contains_key(handle) {
      return Ok(());
    }
    if self.node_drivers.contains_key(&handle.node) {
      // The node is live; the stream is a sub-stream it has not created
      // yet. Register demand so on-demand groups observe it.
      let id = self.node_drivers[&handle.node];
      let node = self.drivers[&id].node.clone();
      if node.group() == GroupMode::OnDemand && handle.name != self.drivers[&id].primary {
        self.demand_substream(handle.node.clone(), &handle.name)?;
      }
      return Ok(());
    }

    let requester_key = self
      .drivers
      .get(&requester)
      .map(|d| d.node.key().to_string())
      .unwrap_or_default();
    let Some(node) = self.registry.get(&handle.node).cloned() else {
      return Err(EngineError::UnmetDependency {
        handle: handle.clone(),
        requester: requester_key,
      });
    };

    // A committed generation satisfies the dependency without executing.
    if self.load_from_store(&node)? && self.stored.contains_key(handle) {
      debug!(node = %node.key(), "dependency_from_store");
      return Ok(());
    }
    if !self.config.materialize_deps {
      return Err(EngineError::UnmetDependency {
        handle: handle.clone(),
        requester: requester_key,
      });
    }

    let id = self.ensure_driver(node.clone(), None)?;
    // Persisted nodes must finish even when only pulled as a dependency;
    // everything else materialized here stays throttled.
    if self.config.persist.iter().any(|n| n == node.fullname()) {
      self.pulling.insert(id);
    }
    if node.group() == GroupMode::OnDemand && handle.name != node.name() {
      self.demand_substream(handle.node.clone(), &handle.name)?;
    }
    Ok(())
  }

  /// Load a node's committed output into the replay cache. Returns false
  /// on NotFound (including version mismatch).
  fn load_from_store(&mut self, node: &Arc<NodeDefinition>) -> Result<bool, EngineError> {
    if self.node_drivers.contains_key(node.key()) {
      return Ok(false);
    }
    let default = node.default_stream(self.setid);
    if self.stored.contains_key(&default) {
      return Ok(true);
    }
    let Some(store) = &self.store else {
      return Ok(false);
    };
    match store.load(self.setid, node.key(), node.version()) {
      Ok(stored) => {
        for (name, msgs) in stored.streams {
          let handle = Handle::new(self.setid, node.key().to_string(), name);
          self.stored.insert(handle, msgs);
        }
        Ok(true)
      }
      Err(StoreError::NotFound { .. }) => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  /// Create (or find) the driver for a definition. `parent` marks a forked
  /// instance whose primary stream is a sub-stream of the parent's.
  fn ensure_driver(
    &mut self,
    node: Arc<NodeDefinition>,
    parent: Option<(DriverId, String)>,
  ) -> Result<DriverId, EngineError> {
    if let Some(&existing) = self.node_drivers.get(node.key()) {
      return Ok(existing);
    }
    self.register(&node);
    let inputs = self.resolve_inputs(&node)?;

    let (primary_name, primary_handle, parent_handle) = match &parent {
      Some((parent_id, fork_name)) => {
        let parent_handle = self
          .drivers
          .get(parent_id)
          .ok_or_else(|| EngineError::InconsistentState {
            message: "fork parent driver missing".to_string(),
          })?
          .primary_handle();
        (
          fork_name.clone(),
          parent_handle.sub(fork_name.clone()),
          Some(parent_handle),
        )
      }
      None => (
        node.name().to_string(),
        node.default_stream(self.setid),
        None,
      ),
    };

    let group = node.group() != GroupMode::None || node.has_foreach();
    let mut stream = Stream::new(primary_handle.clone(), group, self.config.cache_size);

    // Persistence: root persisted nodes open a staging; forked children
    // write into their parent node's staging.
    let staging_key = primary_handle.node.clone();
    if !self.stagings.contains_key(&staging_key)
      && parent.is_none()
      && self.config.persist.iter().any(|n| n == node.fullname())
    {
      let store = self.store.as_ref().ok_or_else(|| EngineError::Protocol {
        node: node.key().to_string(),
        message: "persistence requested without a store".to_string(),
      })?;
      let staging = store.create_staging(self.setid, node.key(), node.version())?;
      self.stagings.insert(
        staging_key.clone(),
        StagingEntry {
          staging: Rc::new(RefCell::new(staging)),
          primary: primary_handle.clone(),
        },
      );
    }
    if let Some(entry) = self.stagings.get(&staging_key) {
      let persistence = entry.staging.borrow_mut().create_stream(&primary_name)?;
      stream = stream.with_persistence(persistence);
    }

    let id = DriverId(self.next_driver);
    self.next_driver += 1;
    let slot = Slot::shared();
    let ctx = TaskContext::new(slot.clone());
    let routine = if node.has_foreach() {
      build_forker(ctx, node.clone(), inputs)
    } else {
      (node.routine())(ctx, inputs)
    };
    let driver = Driver::new(
      id,
      node.clone(),
      slot,
      routine,
      primary_name.clone(),
      stream,
      parent_handle.clone(),
    );

    self.drivers.insert(id, driver);
    self.node_drivers.insert(node.key().to_string(), id);
    self.stream_owners.insert(
      primary_handle,
      StreamRef {
        driver: id,
        name: primary_name,
        parent: parent_handle,
      },
    );
    self.send_queue.push_back((id, Reply::Ack));
    info!(node = %node.key(), driver = %id, "node_started");
    Ok(id)
  }

  fn register(&mut self, node: &Arc<NodeDefinition>) {
    if self.registry.contains_key(node.key()) {
      return;
    }
    self.registry.insert(node.key().to_string(), node.clone());
    for (_, spec) in node.inputs() {
      self.register_spec(spec);
    }
  }

  fn register_spec(&mut self, spec: &InputSpec) {
    match spec {
      InputSpec::Node(node) => self.register(node),
      InputSpec::SubStream { node, .. } => self.register(node),
      InputSpec::Foreach(inner) => self.register_spec(inner),
      InputSpec::Value(_) | InputSpec::Handle(_) => {}
    }
  }

  fn resolve_inputs(&mut self, node: &Arc<NodeDefinition>) -> Result<ResolvedInputs, EngineError> {
    let mut values = Vec::with_capacity(node.inputs().len());
    for (name, spec) in node.inputs() {
      values.push((name.clone(), self.resolve_spec(spec)?));
    }
    Ok(ResolvedInputs::new(values))
  }

  fn resolve_spec(&mut self, spec: &InputSpec) -> Result<InputValue, EngineError> {
    match spec {
      InputSpec::Value(value) => Ok(InputValue::Value(value.clone())),
      InputSpec::Node(node) => Ok(InputValue::Stream(node.default_stream(self.setid))),
      InputSpec::SubStream { node, name } => {
        self.demand_substream(node.key().to_string(), name)?;
        Ok(InputValue::Stream(Handle::new(
          self.setid,
          node.key().to_string(),
          name.clone(),
        )))
      }
      InputSpec::Handle(handle) => Ok(InputValue::Stream(handle.clone())),
      InputSpec::Foreach(inner) => self.resolve_spec(inner),
    }
  }

  /// Record demand for a named sub-stream. A live on-demand driver that
  /// already answered with a smaller set is torn down and restarted.
  fn demand_substream(&mut self, node_key: String, name: &str) -> Result<(), EngineError> {
    let list = self.requested.entry(node_key.clone()).or_default();
    if !list.iter().any(|n| n == name) {
      list.push(name.to_string());
    }
    if let Some(&id) = self.node_drivers.get(&node_key) {
      let answered = self
        .drivers
        .get(&id)
        .and_then(|d| d.requested_answered.clone());
      if let Some(answered) = answered {
        if !answered.iter().any(|n| n == name) {
          self.restart_driver(id)?;
        }
      }
    }
    Ok(())
  }

  /// Tear an on-demand driver down and recreate it from its definition with
  /// the enlarged demand set. Consumers keep their cursors and wait for the
  /// re-produced indices; the routine must be idempotent up to its first
  /// push.
  fn restart_driver(&mut self, id: DriverId) -> Result<(), EngineError> {
    let Some(old) = self.drivers.remove(&id) else {
      return Ok(());
    };
    let node = old.node.clone();
    let was_pulling = self.pulling.remove(&id);
    self.suspended.remove(&id);
    self.paused.remove(&id);
    self.done.remove(&id);
    self.node_drivers.remove(node.key());
    self.send_queue.retain(|(d, _)| *d != id);
    self.waiting.retain(|_, waiters| {
      waiters.retain(|w| *w != id);
      !waiters.is_empty()
    });
    for stream in old.streams.values() {
      self.stream_owners.remove(stream.handle());
    }
    drop(old);
    if let Some(entry) = self.stagings.get(node.key()) {
      entry.staging.borrow_mut().reset()?;
    }

    warn!(node = %node.key(), "node_restarted");
    self.report.restarted.push(node.key().to_string());
    let new_id = self.ensure_driver(node, None)?;
    if was_pulling {
      self.pulling.insert(new_id);
    }
    Ok(())
  }

  fn announce_primary(&mut self, id: DriverId, header: Header) -> Result<(), EngineError> {
    let name = self.drivers[&id].primary.clone();
    self.announce_stream(id, &name, header)
  }

  /// Announce one of a driver's streams, delivering the announcement and
  /// propagating a nested handle message into the parent stream.
  fn announce_stream(
    &mut self,
    id: DriverId,
    name: &str,
    header: Header,
  ) -> Result<(), EngineError> {
    let (msg, handle, info) = {
      let driver = self.drivers.get_mut(&id).expect("driver exists");
      let stream = driver.streams.get_mut(name).expect("owned stream");
      let msg = stream.announce(header)?;
      let info = stream.info().cloned().expect("just announced");
      (msg, stream.handle().clone(), info)
    };
    self.deliver(&handle, &msg)?;

    let parent = self
      .stream_owners
      .get(&handle)
      .and_then(|r| r.parent.clone());
    if let Some(parent_handle) = parent {
      let nested = {
        let parent_ref = self
          .stream_owners
          .get(&parent_handle)
          .cloned()
          .ok_or_else(|| EngineError::InconsistentState {
            message: format!("parent stream {parent_handle} unregistered"),
          })?;
        let parent_driver = self
          .drivers
          .get_mut(&parent_ref.driver)
          .ok_or_else(|| EngineError::InconsistentState {
            message: format!("parent driver for {parent_handle} missing"),
          })?;
        let parent_stream = parent_driver
          .streams
          .get_mut(&parent_ref.name)
          .ok_or_else(|| EngineError::InconsistentState {
            message: format!("parent stream {parent_handle} not owned"),
          })?;
        let nested = parent_stream.push(MsgData::Handle(info))?;
        parent_stream.child_announced(&handle.name);
        nested
      };
      self.deliver(&parent_handle, &nested)?;
      self.maybe_end_parent(&parent_handle)?;
    }
    Ok(())
  }

  /// End a group stream whose routine finished earlier than its children
  /// announced, once the last expected child has announced.
  fn maybe_end_parent(&mut self, handle: &Handle) -> Result<(), EngineError> {
    let ready = self
      .stream(handle)
      .map(|s| s.end_pending() && !s.has_pending_children() && !s.ended())
      .unwrap_or(false);
    if ready {
      self.end_stream(handle)?;
    }
    Ok(())
  }

  fn end_stream(&mut self, handle: &Handle) -> Result<(), EngineError> {
    let msg = {
      let Some(stream) = self.stream_mut(handle) else {
        return Ok(());
      };
      if stream.ended() {
        return Ok(());
      }
      stream.end()?
    };
    self.deliver(handle, &msg)?;
    self.seal_stream(handle)
  }

  /// Seal an ended stream, propagate seal tracking to the parent, and
  /// commit the owning node once every stream of its output has sealed.
  fn seal_stream(&mut self, handle: &Handle) -> Result<(), EngineError> {
    {
      let Some(stream) = self.stream_mut(handle) else {
        return Ok(());
      };
      stream.seal()?;
    }
    let parent = self
      .stream_owners
      .get(handle)
      .and_then(|r| r.parent.clone());
    if let Some(parent_handle) = parent {
      if let Some(parent_stream) = self.stream_mut(&parent_handle) {
        parent_stream.child_sealed(&handle.name);
      }
      self.try_commit(&parent_handle.node)?;
    }
    let node_key = handle.node.clone();
    self.try_commit(&node_key)
  }

  /// Commit the staged generation of a node once its primary stream has
  /// ended and every announced sub-stream has sealed.
  fn try_commit(&mut self, node_key: &str) -> Result<(), EngineError> {
    if self.committed.contains(node_key) {
      return Ok(());
    }
    let Some(entry) = self.stagings.get(node_key) else {
      return Ok(());
    };
    let staging = entry.staging.clone();
    let primary = entry.primary.clone();
    let ready = self
      .stream(&primary)
      .map(|s| s.ended() && s.sealed() && s.all_children_sealed())
      .unwrap_or(false);
    if !ready {
      return Ok(());
    }
    let generation = staging.borrow_mut().commit()?;
    info!(node = %node_key, generation, "stream_committed");
    self.committed.insert(node_key.to_string());
    self
      .report
      .committed
      .push((node_key.to_string(), generation));
    Ok(())
  }

  // ---- completion --------------------------------------------------------

  fn finish_driver(&mut self, id: DriverId, result: Result<(), NodeError>) -> Result<(), EngineError> {
    match result {
      Ok(()) => self.complete_driver(id),
      Err(e) if e.is_abort() => {
        // Declined to produce: downstream observes a normal empty stream.
        info!(driver = %id, reason = %e, "node_aborted");
        self.complete_driver(id)
      }
      Err(e) => {
        let node = self
          .drivers
          .get(&id)
          .map(|d| d.node.key().to_string())
          .unwrap_or_default();
        Err(EngineError::Node { node, source: e })
      }
    }
  }

  /// Wind a finished driver down: end and seal every owned stream, deferring
  /// the primary end while forked children have not yet announced.
  fn complete_driver(&mut self, id: DriverId) -> Result<(), EngineError> {
    let (primary, mut sub_names) = {
      let driver = &self.drivers[&id];
      let subs: Vec<String> = driver
        .streams
        .keys()
        .filter(|n| **n != driver.primary)
        .cloned()
        .collect();
      (driver.primary.clone(), subs)
    };
    sub_names.sort();
    for name in sub_names {
      let handle = self.drivers[&id].streams[&name].handle().clone();
      self.end_stream(&handle)?;
    }

    if !self.drivers[&id].primary_stream().is_announced() {
      self.announce_primary(id, Header::new())?;
    }
    let primary_handle = self.drivers[&id].streams[&primary].handle().clone();
    let defer = self
      .stream(&primary_handle)
      .map(|s| s.has_pending_children() && !s.ended())
      .unwrap_or(false);
    if defer {
      self
        .stream_mut(&primary_handle)
        .expect("primary stream")
        .set_end_pending();
    } else {
      self.end_stream(&primary_handle)?;
    }

    let key = self.drivers[&id].node.key().to_string();
    self.done.insert(id);
    self.pulling.remove(&id);
    self.suspended.remove(&id);
    self.report.finished.push(key.clone());
    info!(node = %key, driver = %id, "node_finished");
    Ok(())
  }

  /// Throttle rule after a driver produced a message: mandatory drivers are
  /// requeued, everything else runs again only when something waits on it.
  fn after_produce(&mut self, id: DriverId) {
    if self.pulling.contains(&id) {
      self.send_queue.push_back((id, Reply::Ack));
    } else {
      debug!(driver = %id, "driver_suspended");
      self.suspended.insert(id);
    }
  }

  fn reply_err(&mut self, id: DriverId, err: NodeError) {
    self.send_queue.push_back((id, Reply::Err(err)));
  }

  /// Release everything a run held: routine futures (and whatever they
  /// own), then staging locks. Runs on success, failure, and cancellation.
  fn teardown(&mut self) {
    for driver in self.drivers.values_mut() {
      driver.drop_routine();
    }
    self.stagings.clear();
    self.suspended.clear();
    self.paused.clear();
    self.send_queue.clear();
    debug!("run_teardown");
  }

  // ---- inspection --------------------------------------------------------

  fn stream(&self, handle: &Handle) -> Option<&Stream> {
    let stream_ref = self.stream_owners.get(handle)?;
    self.drivers.get(&stream_ref.driver)?.streams.get(&stream_ref.name)
  }

  fn stream_mut(&mut self, handle: &Handle) -> Option<&mut Stream> {
    let stream_ref = self.stream_owners.get(handle)?.clone();
    self
      .drivers
      .get_mut(&stream_ref.driver)?
      .streams
      .get_mut(&stream_ref.name)
  }

  /// The retained messages of a stream after the run: the live cache
  /// window, or the full log when it was resolved from the store.
  pub fn cached_messages(&self, handle: &Handle) -> Option<Vec<Msg>> {
    if let Some(stream) = self.stream(handle) {
      return Some(stream.cached());
    }
    self.stored.get(handle).cloned()
  }

  /// Just the payload values of [`Scheduler::cached_messages`].
  pub fn payload_values(&self, handle: &Handle) -> Option<Vec<Value>> {
    Some(
      self
        .cached_messages(handle)?
        .iter()
        .filter_map(|msg| msg.payload().cloned())
        .collect(),
    )
  }
}
