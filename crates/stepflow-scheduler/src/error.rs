// Scheduler error taxonomy

use thiserror::Error;

use stepflow_engine::EngineError;
use stepflow_storage::StoreError;

/// Errors surfaced by scheduler construction and lifecycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A handler's cron expression failed to parse. Construction-time only;
    /// the scheduler refuses to exist with an invalid schedule.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Construction requires at least one handler carrying a cron.
    #[error("scheduler requires at least one handler with a cron expression")]
    NoScheduledHandlers,

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
