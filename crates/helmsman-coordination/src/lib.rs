//! helmsman-coordination — the coordination layer.
//!
//! A durable key/value store holding the advisory intake lock, the
//! in-progress and paused deployment maps, the awaiting-pause and
//! awaiting-cancel request sets, and a persistent at-least-once work
//! queue consumed by a pool of workers with per-message leases.
//!
//! # Architecture
//!
//! Backed by [redb](https://docs.rs/redb) behind an `Arc`, with on-disk
//! and in-memory backends. Entries live under operator-readable keys
//! (`{prefix}:lock`, `{prefix}:deployments:in-progress:{app}-{env}-{region}`,
//! ...). The atomic set-if-absent of `register_in_progress` runs inside a
//! single write transaction and is the only cross-deployment
//! synchronization primitive in the system.

pub mod error;
pub mod queue;
pub mod store;
pub mod tables;

pub use error::{CoordinationError, CoordinationResult};
pub use queue::{ConsumerOptions, HandlerResult, QueueHandler, WorkQueue};
pub use store::CoordinationStore;
