//! Error types for nanobatch.

use thiserror::Error;

/// Result type alias for nanobatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nanobatch.
#[derive(Error, Debug)]
pub enum Error {
    /// KV cache allocation failed - no free capacity left.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Sequence not found where one was expected.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Request not found in any scheduler queue.
    #[error("request {0} not found")]
    RequestNotFound(String),

    /// Request id already present in the scheduler.
    #[error("request {0} already exists")]
    DuplicateRequest(String),

    /// Sequence id already present in its group.
    #[error("sequence {seq_id} already in group {request_id}")]
    DuplicateSequence { request_id: String, seq_id: u64 },

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A waiting group must hold exactly one prompt sequence.
    #[error("waiting group {request_id} has {num_seqs} sequences, expected 1")]
    InvalidWaitingGroup { request_id: String, num_seqs: usize },

    /// Scheduled more tokens than the configured budget allows.
    #[error("scheduled {scheduled} tokens, budget is {limit}")]
    TokenBudgetExceeded { scheduled: usize, limit: usize },

    /// Scheduled more sequences than the configured limit allows.
    #[error("scheduled {scheduled} sequences, limit is {limit}")]
    SeqBudgetExceeded { scheduled: usize, limit: usize },

    /// Model runner returned the wrong number of group outputs.
    #[error("runner returned {actual} outputs for {expected} scheduled groups")]
    OutputCountMismatch { expected: usize, actual: usize },

    /// A declared but unimplemented scheduling path was reached.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// Internal bookkeeping invariant violated.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
