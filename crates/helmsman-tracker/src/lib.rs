//! helmsman-tracker — scheduled polling of remote tasks.
//!
//! A deployment task that drives a long-running remote job carries a
//! task URL. The tracker polls that URL on a shared scheduled pool,
//! merging the remote document into the stored task, until the remote
//! reports a terminal status or the retry budget runs out — then it
//! hands control back to the pipeline through one of two callbacks.

pub mod error;
pub mod tracker;

pub use error::{TrackerError, TrackerResult};
pub use tracker::{TaskCallback, TaskTracker, DEFAULT_POLL_BUDGET};
