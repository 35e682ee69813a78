//! # Stepflow Core
//!
//! Shared data model for the stepflow orchestration engine.
//!
//! An *execution* is one submitted event moving through the status machine
//! (`queued` → `processing` → `completed`/`failed`/`retrying`). A *step* is a
//! named, memoized unit of work inside a handler invocation; its successful
//! result is checkpointed so retries resume after it instead of re-running it.
//!
//! This crate defines the records for both, their dual representation (typed
//! document fields on one side, string-only KV hash fields on the other), the
//! step digest, the cache envelope that distinguishes "cached null" from
//! "never ran", and the in-process lifecycle event bus.

pub mod error;
pub mod events;
pub mod execution;
pub mod schedule;
pub mod step;

pub use error::RecordError;
pub use events::{EventBus, LifecycleEvent};
pub use execution::{generate_execution_id, ExecutionRecord, ExecutionStatus};
pub use schedule::CronExecutionRecord;
pub use step::{decode_step_blob, encode_step_value, step_id, CacheLookup, StepRecord};

/// Current time as milliseconds since the Unix epoch.
///
/// All record timestamps in both stores use this representation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
