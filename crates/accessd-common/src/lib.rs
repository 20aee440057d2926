//! Common orchestration plumbing for the accessd agent.
//!
//! This crate provides the two generic building blocks the flow programmer
//! is built on:
//!
//! - [`IdAllocator`]: stable small-integer identifiers per namespace, keyed
//!   by an opaque string, with liveness-callback garbage collection
//! - [`TaskQueue`]: per-key FIFO task dispatch over a worker pool
//!
//! # Dispatch model
//!
//! Updates arrive from arbitrary threads. Each update is enqueued under a
//! logical key; work for the same key is serialized in enqueue order while
//! distinct keys run in parallel. No handler ever observes a half-applied
//! update for its key.

mod idgen;
mod taskq;

pub use idgen::{IdAllocator, IdError};
pub use taskq::TaskQueue;
