//! helmsman-store — embedded deployment document store.
//!
//! Backed by [redb](https://docs.rs/redb), holds the authoritative history
//! of every deployment: its parameters, its ordered task list, and the
//! per-task status and log that callers read to surface progress.
//!
//! # Architecture
//!
//! Deployment documents are JSON-serialized into redb's `&[u8]` value
//! column, keyed by deployment id. The `DeploymentStore` is `Clone` +
//! `Send` + `Sync` (backed by `Arc<Database>`) and can be shared across
//! async tasks. Document writes are last-writer-wins; the orchestrator's
//! single-writer-per-deployment rule makes that safe.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::DeploymentStore;
pub use types::*;
