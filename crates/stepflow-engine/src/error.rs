// Engine error taxonomy

use thiserror::Error;

use stepflow_storage::StoreError;

/// Errors surfaced by the client and the worker pool.
///
/// Handler failures are deliberately absent: a throwing handler is recorded
/// on its execution and fed to the retry policy, it never propagates out of
/// the pool.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation attempted before the startup handshake completed.
    #[error("not ready: startup handshake has not completed")]
    NotReady,

    /// Two handlers registered under one event name.
    #[error("duplicate handler registered for event: {0}")]
    DuplicateHandler(String),

    /// `start` called on a pool that is already running.
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Lifecycle operation on a pool that is not running.
    #[error("worker pool is not running")]
    NotRunning,

    /// KV or document store I/O failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
