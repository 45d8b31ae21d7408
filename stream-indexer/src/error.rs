//! Error types for the stream indexer

use thiserror::Error;

/// Result type for indexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Indexer errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] stream_ledger::Error),

    /// Malformed task id or payload
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Worker channel closed or task join failure
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Concurrency(format!("Blocking task failed: {}", err))
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
