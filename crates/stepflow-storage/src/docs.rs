//! DocStore trait definition
//!
//! The document store is the durable source of truth. It holds three
//! collections: `executions`, `steps` and `cron_executions`, with the
//! secondary indexes created by [`DocStore::ensure_indexes`].

use async_trait::async_trait;
use serde_json::Value;

use stepflow_core::{CronExecutionRecord, ExecutionRecord, ExecutionStatus, StepRecord};

use crate::error::StoreError;

/// Sort direction for listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first (orphan recovery order).
    Ascending,
    /// Newest first (dashboard order).
    Descending,
}

/// Filter for execution listing and counting.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Match a single status.
    pub status: Option<ExecutionStatus>,
    /// Match any of several statuses; combined with `status` it is an OR set.
    pub statuses: Option<Vec<ExecutionStatus>>,
    pub event_name: Option<String>,
}

impl ExecutionFilter {
    pub fn by_status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Executions a crashed worker may have stranded in-flight.
    pub fn in_flight() -> Self {
        Self {
            statuses: Some(vec![ExecutionStatus::Processing, ExecutionStatus::Retrying]),
            ..Default::default()
        }
    }

    /// The statuses this filter matches, or `None` when it matches all.
    pub fn status_set(&self) -> Option<Vec<ExecutionStatus>> {
        match (&self.status, &self.statuses) {
            (None, None) => None,
            (status, statuses) => {
                let mut set: Vec<ExecutionStatus> = statuses.clone().unwrap_or_default();
                if let Some(s) = status {
                    if !set.contains(s) {
                        set.push(*s);
                    }
                }
                Some(set)
            }
        }
    }
}

/// Field updates applied to one execution.
///
/// Present fields are set (last writer wins); `clear_errors` additionally
/// unsets `error` and `error_stack`, the document-store equivalent of a
/// `$set` + `$unset` pair.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub attempt_count: Option<u32>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub updated_at: Option<i64>,
    pub clear_errors: bool,
}

impl ExecutionUpdate {
    /// Transition to a status, stamping `updated_at`.
    pub fn to_status(status: ExecutionStatus, updated_at: i64) -> Self {
        Self {
            status: Some(status),
            updated_at: Some(updated_at),
            ..Default::default()
        }
    }
}

/// Typed operations over the durable collections.
///
/// Implementations must be thread-safe; concurrent updates on distinct ids
/// are safe, concurrent updates on one id are last-writer-wins.
#[async_trait]
pub trait DocStore: Send + Sync + 'static {
    /// Connectivity probe used by the startup handshake.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Idempotently create the collections and secondary indexes.
    ///
    /// "Already exists with the same spec" is success.
    async fn ensure_indexes(&self, logging: bool) -> Result<(), StoreError>;

    // =========================================================================
    // executions
    // =========================================================================

    /// Insert a new execution. The id is unique; inserting a duplicate fails.
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn find_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// List executions matching `filter`, ordered by `created_at`.
    ///
    /// `limit <= 0` means no limit.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        order: SortOrder,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn count_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<u64, StoreError>;

    /// Apply `update` to the execution with `id`.
    async fn update_execution(
        &self,
        id: &str,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // steps
    // =========================================================================

    /// Record a completed step. (`execution_id`, `step_id`) is unique; a
    /// replayed write for the same pair overwrites the previous row.
    async fn insert_step(&self, record: &StepRecord) -> Result<(), StoreError>;

    /// All steps of one execution, timestamp ascending.
    async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // cron_executions
    // =========================================================================

    /// Insert or replace the bookkeeping row for one scheduled function.
    async fn upsert_cron_execution(
        &self,
        record: &CronExecutionRecord,
    ) -> Result<(), StoreError>;

    async fn find_cron_execution(
        &self,
        function_id: &str,
    ) -> Result<Option<CronExecutionRecord>, StoreError>;
}
