use super::buffer::BlockKind;
use crate::core::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("Invalid decomposition setup: {0}")]
    Configuration(String),

    #[error("Rank {rank} is out of range for a communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("Peer rank {peer} disconnected")]
    Disconnected { peer: usize },

    #[error("Protocol mismatch: expected tag {expected} from rank {from_rank}, got tag {found}")]
    ProtocolMismatch {
        from_rank: usize,
        expected: u32,
        found: u32,
    },

    #[error(
        "Buffer overflow while packing {kind} block: {elements} elements need {needed} bytes but capacity is {capacity} bytes"
    )]
    BufferOverflow {
        kind: BlockKind,
        elements: usize,
        needed: usize,
        capacity: usize,
    },

    #[error("Block mismatch: expected a {expected} record but the current block holds {found}")]
    BlockMismatch { expected: BlockKind, found: String },

    #[error("Buffer underflow: {0}")]
    BufferUnderflow(String),

    #[error("Buffer misuse: {0}")]
    BufferState(&'static str),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Atom {id} has position {position:?}, which cannot be mapped into the periodic cell")]
    UnmappablePosition { id: u32, position: [f64; 3] },

    #[error("Ownership inconsistency on rank {rank}: {message}")]
    OwnershipInconsistency { rank: usize, message: String },

    #[error("Group member atom {0} has no owner")]
    UnknownAtom(u32),

    #[error("Exchanger stopped after an earlier failure: {cause}")]
    ExchangerFailed { cause: String },

    #[error("No ghost communication plan: a full exchange must run first")]
    NoGhostPlan,

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Rank {rank}, step {step}: {source}")]
    Step {
        rank: usize,
        step: u64,
        #[source]
        source: Box<CommError>,
    },

    #[error("Rank {rank}, distribution: {source}")]
    Distribution {
        rank: usize,
        #[source]
        source: Box<CommError>,
    },
}

impl CommError {
    /// Returns `true` if this error, or the error it wraps, is a buffer overflow.
    pub fn is_overflow(&self) -> bool {
        match self {
            CommError::BufferOverflow { .. } => true,
            CommError::Step { source, .. } | CommError::Distribution { source, .. } => {
                source.is_overflow()
            }
            _ => false,
        }
    }

    /// Returns `true` for errors caused by a peer having exited.
    ///
    /// When one worker fails, its peers usually fail with `Disconnected`
    /// shortly afterwards; callers that join all workers prefer the other errors.
    pub fn is_disconnect(&self) -> bool {
        match self {
            CommError::Disconnected { .. } => true,
            CommError::Step { source, .. } | CommError::Distribution { source, .. } => {
                source.is_disconnect()
            }
            _ => false,
        }
    }
}
