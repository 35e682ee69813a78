//! Event submission client
//!
//! The client is the producing side of the engine: it writes the execution
//! record to both stores in parallel and only then appends the id to the
//! queue, so a worker can never pop an id whose record is missing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use stepflow_core::{generate_execution_id, now_millis, EventBus, ExecutionRecord, ExecutionStatus};
use stepflow_storage::{DocStore, ExecutionUpdate, QueueKeys, QueueStore, StoreError};

use crate::error::EngineError;

/// An event to submit.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub name: String,
    pub data: Value,
    /// Caller-supplied execution id; generated when absent.
    pub id: Option<String>,
    /// Caller-supplied submission time; `now` when absent.
    pub timestamp: Option<i64>,
}

impl SubmitRequest {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            id: None,
            timestamp: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Producer handle over both stores.
///
/// Construct with [`Client::new`], then [`Client::handshake`] before use;
/// submission on an un-handshaken client is rejected with
/// [`EngineError::NotReady`].
pub struct Client {
    queue: Arc<dyn QueueStore>,
    docs: Arc<dyn DocStore>,
    keys: QueueKeys,
    #[allow(dead_code)]
    bus: EventBus,
    ready: AtomicBool,
}

impl Client {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        docs: Arc<dyn DocStore>,
        keys: QueueKeys,
        bus: EventBus,
    ) -> Self {
        Self {
            queue,
            docs,
            keys,
            bus,
            ready: AtomicBool::new(false),
        }
    }

    /// Ping both stores; the client accepts submissions once this succeeds.
    pub async fn handshake(&self) -> Result<(), EngineError> {
        futures::try_join!(self.queue.ping(), self.docs.ping())?;
        self.ready.store(true, Ordering::SeqCst);
        debug!("client handshake completed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    /// Submit an event; returns its execution id.
    #[instrument(skip(self, request), fields(event_name = %request.name))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, EngineError> {
        self.ensure_ready()?;

        let id = request.id.unwrap_or_else(generate_execution_id);
        let now = request.timestamp.unwrap_or_else(now_millis);
        let record =
            ExecutionRecord::queued(id.clone(), request.name, request.data.to_string(), now);

        let kv_key = self.keys.execution(&id);
        let kv_fields = record.to_kv_fields();
        futures::try_join!(
            self.queue.hash_set(&kv_key, &kv_fields),
            self.docs.insert_execution(&record),
        )?;
        self.queue.list_push_right(&self.keys.queue(), &id).await?;

        debug!(execution_id = %id, "event submitted");
        Ok(id)
    }

    /// Force an execution back to `queued` from any state.
    ///
    /// Resets the attempt count, clears error fields in both stores, and
    /// re-enqueues the id. Deliberately no current-state check.
    #[instrument(skip(self))]
    pub async fn manual_retry(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_ready()?;

        let mut record = self
            .docs
            .find_execution(id)
            .await?
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;

        let now = now_millis();
        record.status = ExecutionStatus::Queued;
        record.attempt_count = 0;
        record.updated_at = now;
        record.error = None;
        record.error_stack = None;

        let update = ExecutionUpdate {
            status: Some(ExecutionStatus::Queued),
            attempt_count: Some(0),
            updated_at: Some(now),
            clear_errors: true,
            ..Default::default()
        };

        // Rewrite the hash from scratch so stale error fields disappear from
        // the KV shape as well.
        let kv_key = self.keys.execution(id);
        self.queue.delete(&kv_key).await?;
        let kv_fields = record.to_kv_fields();
        futures::try_join!(
            self.queue.hash_set(&kv_key, &kv_fields),
            self.docs.update_execution(id, &update),
        )?;
        self.queue.list_push_right(&self.keys.queue(), id).await?;

        debug!(execution_id = %id, "manual retry enqueued");
        Ok(())
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}
