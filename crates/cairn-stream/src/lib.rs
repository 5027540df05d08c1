//! Cairn Stream
//!
//! This crate provides the identity and transfer primitives the engine moves
//! data with:
//!
//! - [`Setid`]: 128-bit dataset identifier with a stable textual encoding
//! - [`Handle`]: identity of one stream, `(setid, node, name)`
//! - [`Msg`]: one indexed message on a handle, terminated by [`MsgData::End`]
//! - [`Stream`]: a bounded, append-only replay cache for one handle, either
//!   volatile (memory only) or persistent via the [`Persistence`] trait
//!
//! The engine owns all mutation; consumers only ever read cached messages.

mod error;
mod handle;
mod msg;
mod setid;
mod stream;

pub use error::StreamError;
pub use handle::{Handle, HandleInfo, Header};
pub use msg::{Msg, MsgData};
pub use setid::Setid;
pub use stream::{DEFAULT_CACHE_SIZE, GetMsg, Persistence, Stream};
