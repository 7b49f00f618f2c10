use std::io;
use std::net::AddrParseError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connect, accept, send or receive failed.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A relative path that would resolve outside the mirrored root.
    #[error("path escapes the mirror root: {0}")]
    PathViolation(String),

    #[error("could not apply change to {path}: {reason}")]
    ApplyFailure { path: PathBuf, reason: String },

    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// The peer answered a binary transfer with something other than `OK`.
    #[error("peer rejected transfer of {path}: {reply}")]
    Rejected { path: String, reply: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn apply(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SyncError::ApplyFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn frame(reason: impl Into<String>) -> Self {
        SyncError::InvalidFrame(reason.into())
    }
}
