use std::path::{Path, PathBuf};

use crate::types::RedoError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Data directory or its redo log not found.
    #[error("data directory not initialized: {0}")]
    MissingDataDir(PathBuf),
    /// The directory already holds a redo log.
    #[error("data directory already initialized: {0}")]
    AlreadyInitialized(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Core error.
    #[error(transparent)]
    Core(#[from] RedoError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_data_dir(path: impl AsRef<Path>) -> Self {
        AdminError::MissingDataDir(path.as_ref().to_path_buf())
    }
}
