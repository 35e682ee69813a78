//! Memoized step execution
//!
//! `RunStep` semantics: a named step computes at most once successfully per
//! execution. Lookup is three-tiered: the in-process memo map, then the KV
//! checkpoint cache, then the caller's compute function. Successful results
//! are persisted to both stores before they are returned, so a crash after a
//! step completes never re-runs it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use stepflow_core::{
    decode_step_blob, encode_step_value, now_millis, step_id, CacheLookup, EventBus,
    LifecycleEvent, StepRecord,
};
use stepflow_storage::{DocStore, QueueKeys, QueueStore};

/// Step runner bound to one execution.
///
/// The KV handle is the execution's dedicated step connection: step cache
/// traffic must never ride the worker's blocking dequeue connection, and the
/// worker releases this one when the handler returns.
pub struct StepRunner {
    execution_id: String,
    steps_key: String,
    cache: Arc<dyn QueueStore>,
    docs: Arc<dyn DocStore>,
    bus: EventBus,
    memo: Mutex<HashMap<String, Value>>,
}

impl StepRunner {
    pub(crate) fn new(
        execution_id: &str,
        keys: &QueueKeys,
        cache: Arc<dyn QueueStore>,
        docs: Arc<dyn DocStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            steps_key: keys.steps(execution_id),
            cache,
            docs,
            bus,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Run a named step, returning its memoized value when a prior attempt
    /// already completed it.
    ///
    /// `compute` runs only on a cache miss. Its error propagates unwrapped
    /// and nothing is written (handler failures belong to the worker pool's
    /// retry policy, not to the step cache). A step that successfully returns
    /// a null-like value is still a completed step: the cache envelope keeps
    /// it distinguishable from "never ran".
    pub async fn run<T, F, Fut>(&self, title: &str, compute: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let step_id = step_id(title);

        if let Some(value) = self.memo.lock().await.get(&step_id) {
            debug!(execution_id = %self.execution_id, step = title, "step served from memo");
            return Ok(serde_json::from_value(value.clone())?);
        }

        let blob = self.cache.hash_field(&self.steps_key, &step_id).await?;
        if let CacheLookup::Hit(value) = decode_step_blob(blob.as_deref()) {
            debug!(execution_id = %self.execution_id, step = title, "step served from checkpoint");
            self.memo.lock().await.insert(step_id, value.clone());
            return Ok(serde_json::from_value(value)?);
        }

        let output = compute().await?;

        let value = serde_json::to_value(&output)?;
        let record = StepRecord::completed(&self.execution_id, title, value.clone(), now_millis());
        let blob = encode_step_value(&value);
        let fields = [(step_id.clone(), blob)];
        futures::try_join!(
            self.docs.insert_step(&record),
            self.cache.hash_set(&self.steps_key, &fields),
        )?;
        self.memo.lock().await.insert(step_id, value);

        self.bus.emit(LifecycleEvent::StepComplete {
            execution_id: self.execution_id.clone(),
            step_name: title.to_string(),
        });
        debug!(execution_id = %self.execution_id, step = title, "step computed and checkpointed");
        Ok(output)
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}
