//! # puck-queue
//!
//! The persistent download queue: targets (local files to produce),
//! sources (nicks and remote paths that can provide them), directory
//! placeholders that resolve lazily through a fetched filelist, and
//! per-nick filelist downloads.
//!
//! Every mutation is written through to a JSON-lines operation log
//! before its effect becomes observable; on restart the queue is rebuilt
//! from the log, never from memory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod queue;
pub mod store;

pub use queue::{
    NextItem, Priority, Queue, QueueDirectory, QueueError, QueueEvent, Source, Target,
};
pub use store::{QueueOp, QueueStore};
