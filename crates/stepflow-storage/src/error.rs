// Error type shared by both store contracts

use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to reach or authenticate with the store.
    #[error("connection error: {0}")]
    Connection(String),

    /// KV/queue store command error.
    #[error("queue store error: {0}")]
    Kv(String),

    /// Document store query error.
    #[error("document store error: {0}")]
    Database(String),

    /// Value could not be (de)serialized at the store boundary.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An update targeted an execution that does not exist.
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
}
