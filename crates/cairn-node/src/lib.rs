//! Cairn Node
//!
//! This crate provides the declarative node model and the boundary a node
//! routine talks to the engine through:
//!
//! - [`NodeDefinition`]: an immutable description of one transformation step,
//!   with a content-derived identity that is stable across process restarts
//! - [`InputSpec`] / [`ResolvedInputs`]: declared and resolved node inputs
//! - [`Graph`]: the dependency graph spanned by a set of root definitions
//! - [`TaskContext`]: the request protocol as seen from inside a routine —
//!   every suspension point of a routine is one of its methods
//!
//! Routines are plain futures; they never see the scheduler. Each protocol
//! call deposits a [`Request`] in a shared slot and suspends until the
//! engine resumes the routine with the matching [`Reply`].

mod context;
mod error;
mod graph;
mod input;
mod node;

pub use context::{Item, PullReply, Reply, Request, SharedSlot, Slot, TaskContext};
pub use error::NodeError;
pub use graph::Graph;
pub use input::{InputSpec, InputValue, ResolvedInputs};
pub use node::{GroupMode, NodeBuilder, NodeDefinition, Routine, RoutineFuture};
