//! Error taxonomy for the retrieval engine.
//!
//! Per-record failures during batch operations are reported in aggregate
//! (counts and flagged indexes), never as errors. The variants here cover
//! the structural failures that are fatal to a single operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A remote embedding call failed or returned malformed data.
    ///
    /// `failed` holds the positions (in the caller's input order) of the
    /// texts whose embeddings could not be obtained. Raised only when no
    /// requested item succeeded; partial batches are returned with the
    /// failed indexes flagged instead.
    #[error("embedding generation failed for {} item(s): {reason}", failed.len())]
    Generation { failed: Vec<usize>, reason: String },

    /// The message source was unreachable or denied the request.
    #[error("source fetch failed: {0}")]
    Fetch(String),

    /// A vector's length disagrees with the index's established
    /// dimensionality. Never silently truncated or padded.
    #[error("embedding dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The persisted record set could not be read in a way that permits
    /// rebuilding the index. The loader starts empty rather than guess.
    #[error("corrupt storage: {0}")]
    CorruptStorage(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Persist(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
