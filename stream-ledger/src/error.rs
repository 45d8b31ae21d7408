//! Error types for the streaming ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invalid event
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Discrete balance would go negative
    #[error("Insufficient balance for {account}: has {available}, needs {required}")]
    InsufficientBalance {
        /// Account being debited
        account: String,
        /// Current balance
        available: crate::types::Amount,
        /// Amount requested
        required: crate::types::Amount,
    },

    /// Time arithmetic overflowed
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Invariant violation (ordering, perspective, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
