//! Error types for nano-serve.

use thiserror::Error;

use crate::core::block::BlockId;
use crate::core::request::RequestId;

/// Result type alias for nano-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free KV cache blocks for the requested allocation.
    #[error("out of KV cache blocks: requested {requested}, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    /// Double free or out-of-range block id.
    #[error("invalid block {0}: out of range or already free")]
    InvalidBlock(BlockId),

    /// A single sequence needs more blocks than the whole pool holds.
    #[error("sequence needs {required} blocks but the KV cache only has {total}")]
    CapacityExceeded { required: usize, total: usize },

    /// Request not found in scheduler.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Rejected request parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Model executor failure.
    #[error("executor error: {0}")]
    Executor(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The handler loop is no longer accepting requests.
    #[error("handler has been stopped")]
    HandlerStopped,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error means the block pool bookkeeping is corrupt.
    ///
    /// Fatal errors must never be converted into a per-request status.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidBlock(_))
    }
}
