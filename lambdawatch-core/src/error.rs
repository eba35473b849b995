use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Watch directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Event source failed: {0}")]
    EventSourceFailed(String),

    #[error("Session is not running: {0}")]
    SessionInactive(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Failure reported by a [`crate::orchestration::DatasetProcessor`].
///
/// Every variant is terminal for the dataset that produced it; the dispatcher
/// never retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("part file missing or unreadable: {}: {reason}", .path.display())]
    UnreadablePart { path: PathBuf, reason: String },

    #[error("processor command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("processor panicked: {0}")]
    Panicked(String),

    #[error("dispatcher closed before the job ran")]
    Abandoned,

    #[error("processing failed: {0}")]
    Failed(String),
}

impl ProcessingError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ProcessingError::Failed(msg.into())
    }
}

impl From<std::io::Error> for ProcessingError {
    fn from(err: std::io::Error) -> Self {
        ProcessingError::Failed(err.to_string())
    }
}
