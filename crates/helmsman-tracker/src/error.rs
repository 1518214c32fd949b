//! Error classification for task polling.

use thiserror::Error;

use helmsman_remote::RemoteError;
use helmsman_store::StoreError;

/// Result type alias for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Failures observed while polling a remote task.
///
/// `http` and `store` failures are transient: the tracker decrements its
/// retry budget and reschedules. Anything else propagates (logged, task
/// not advanced) and the restart sweep picks the deployment up after a
/// process restart.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http failure while polling task: {0}")]
    Http(RemoteError),

    #[error("store failure while polling task: {0}")]
    Store(#[from] StoreError),

    #[error("remote contract violation while polling task: {0}")]
    Remote(RemoteError),

    #[error("task {0} has no URL to poll")]
    MissingTaskUrl(String),
}

impl TrackerError {
    /// Classification tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Http(_) => "http",
            TrackerError::Store(_) => "store",
            TrackerError::Remote(_) => "remote",
            TrackerError::MissingTaskUrl(_) => "missing-url",
        }
    }

    /// Whether a retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::Http(_) | TrackerError::Store(_))
    }
}

impl From<RemoteError> for TrackerError {
    fn from(e: RemoteError) -> Self {
        if e.is_transient() {
            TrackerError::Http(e)
        } else {
            TrackerError::Remote(e)
        }
    }
}
