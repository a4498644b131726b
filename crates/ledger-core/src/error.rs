use thiserror::Error;

/// Errors surfaced by the chain and its stores.
///
/// None of these are retried or repaired locally: each one aborts the
/// operation that raised it and is handed back to the caller.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The backing store could not be opened (bad path, locked, unreadable).
    #[error("failed to open store at {path}: {reason}")]
    StoreOpen { path: String, reason: String },

    /// A read or a transaction commit failed in the backing store.
    #[error("store i/o error: {0}")]
    StoreIo(String),

    /// Stored bytes did not decode into a block, or decoded into a block
    /// whose hash does not match.
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    /// A hash reachable from the head has no block stored under it.
    #[error("block {0} not found in store")]
    MissingBlock(String),

    /// The blocks bucket exists but holds no head pointer.
    #[error("blocks bucket has no head pointer")]
    MissingHead,

    /// The head pointer is present but is not a block hash.
    #[error("corrupt head pointer: {0}")]
    CorruptHead(String),

    /// The write committed and is visible to readers, but flushing it to
    /// disk failed. The chain treats the write as applied.
    #[error("write committed but not flushed: {0}")]
    Unflushed(String),

    #[error("failed to encode block: {0}")]
    Encode(String),
}

impl ChainError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        ChainError::StoreIo(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
