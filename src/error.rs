//! Error types for pagedserve.

use thiserror::Error;

/// Result type alias for pagedserve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pagedserve.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    ///
    /// Recoverable: the scheduler defers or preempts and retries next step.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Not enough device memory to carve out a single cache block.
    #[error("not enough memory for the KV cache")]
    OutOfMemory,

    /// Configuration error (fatal at initialization).
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint streaming finished with unwritten parameters.
    #[error("missing weights: {0:?}")]
    MissingWeights(Vec<String>),

    /// A worker failed during init or a forward step (fatal).
    #[error("worker failure: {0}")]
    Worker(String),

    /// Invalid sequence phase transition.
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidPhase {
        from: &'static str,
        to: &'static str,
    },

    /// Sequence not found in the scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
