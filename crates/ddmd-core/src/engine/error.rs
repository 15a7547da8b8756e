use thiserror::Error;

use super::config::ConfigError;
use crate::comm::error::CommError;
use crate::core::boundary::BoundaryError;
use crate::core::io::archive::ArchiveError;
use crate::core::storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid periodic cell: {0}")]
    Boundary(#[from] BoundaryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Communication failed: {0}")]
    Comm(#[from] CommError),

    #[error("Checkpoint error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Domain worker {rank} failed: {message}")]
    Worker { rank: usize, message: String },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns `true` if the error only reports that a peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, EngineError::Comm(e) if e.is_disconnect())
    }
}
