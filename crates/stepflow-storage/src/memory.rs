//! In-memory implementations of both store contracts
//!
//! These back the test suites and single-process deployments with the same
//! semantics as the Redis and PostgreSQL backends: the blocking pop hands
//! each value to exactly one caller, TTL keys expire, and the document
//! queries filter, sort and paginate the way the indexed SQL does.
//!
//! A duplicated adapter shares the underlying state the way two connections
//! share one server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use stepflow_core::{CronExecutionRecord, ExecutionRecord, ExecutionStatus, StepRecord};

use crate::docs::{DocStore, ExecutionFilter, ExecutionUpdate, SortOrder};
use crate::error::StoreError;
use crate::queue::QueueStore;

// =============================================================================
// Queue store
// =============================================================================

#[derive(Default)]
struct KvState {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    /// TTL-bound string keys: value and expiry instant.
    strings: HashMap<String, (String, Instant)>,
}

impl KvState {
    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .strings
            .get(key)
            .map_or(false, |(_, expires_at)| *expires_at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
    }
}

/// In-memory [`QueueStore`].
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<KvState>>,
    wakeups: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wakeup_for(&self, list: &str) -> Arc<Notify> {
        Arc::clone(
            self.wakeups
                .lock()
                .entry(list.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn pop_front(&self, list: &str) -> Option<String> {
        self.state.lock().lists.get_mut(list)?.pop_front()
    }

    /// Number of values currently queued on `list`.
    pub fn list_len(&self, list: &str) -> usize {
        self.state.lock().lists.get(list).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn list_push_right(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.wakeup_for(list).notify_one();
        Ok(())
    }

    async fn list_pop_left_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.wakeup_for(list);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before the check so a push between the check
            // and the await still wakes us.
            let _ = notified.as_mut().enable();

            if let Some(value) = self.pop_front(list) {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        if let Some((_, expires_at)) = state.strings.get_mut(key) {
            *expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        Ok(state
            .strings
            .get(key)
            .map(|(_, expires_at)| {
                expires_at.saturating_duration_since(Instant::now()).as_secs() as i64
            })
            .unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.hashes.remove(key);
        state.lists.remove(key);
        state.strings.remove(key);
        Ok(())
    }

    async fn duplicate(&self) -> Result<Arc<dyn QueueStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// Document store
// =============================================================================

#[derive(Default)]
struct DocState {
    executions: HashMap<String, ExecutionRecord>,
    /// Insertion-ordered; the unique (execution_id, step_id) pair is enforced
    /// by replacing in place.
    steps: Vec<StepRecord>,
    cron_executions: HashMap<String, CronExecutionRecord>,
}

/// In-memory [`DocStore`].
#[derive(Clone, Default)]
pub struct MemoryDocStore {
    state: Arc<Mutex<DocState>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions (test helper).
    pub fn execution_count(&self) -> usize {
        self.state.lock().executions.len()
    }

    /// Number of stored steps (test helper).
    pub fn step_count(&self) -> usize {
        self.state.lock().steps.len()
    }
}

fn matches(filter: &ExecutionFilter, record: &ExecutionRecord) -> bool {
    if let Some(set) = filter.status_set() {
        if !set.contains(&record.status) {
            return false;
        }
    }
    if let Some(event_name) = &filter.event_name {
        if &record.event_name != event_name {
            return false;
        }
    }
    true
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_indexes(&self, _logging: bool) -> Result<(), StoreError> {
        // Uniqueness is enforced structurally; nothing to create.
        Ok(())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.executions.contains_key(&record.id) {
            return Err(StoreError::Database(format!(
                "duplicate execution id: {}",
                record.id
            )));
        }
        state.executions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.state.lock().executions.get(id).cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        order: SortOrder,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let state = self.state.lock();
        let mut records: Vec<ExecutionRecord> = state
            .executions
            .values()
            .filter(|r| matches(filter, r))
            .cloned()
            .collect();
        // Tie-break on id so pagination is stable.
        records.sort_by(|a, b| {
            let ord = a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
            match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });

        let skip = skip.max(0) as usize;
        let mut records: Vec<ExecutionRecord> = records.into_iter().skip(skip).collect();
        if limit > 0 {
            records.truncate(limit as usize);
        }
        Ok(records)
    }

    async fn count_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(state
            .executions
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .count() as u64)
    }

    async fn update_execution(
        &self,
        id: &str,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(attempt_count) = update.attempt_count {
            record.attempt_count = attempt_count;
        }
        if let Some(result) = &update.result {
            record.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            record.error = Some(error.clone());
        }
        if let Some(error_stack) = &update.error_stack {
            record.error_stack = Some(error_stack.clone());
        }
        if let Some(updated_at) = update.updated_at {
            record.updated_at = updated_at;
        }
        if update.clear_errors {
            record.error = None;
            record.error_stack = None;
        }
        Ok(())
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .steps
            .iter_mut()
            .find(|s| s.execution_id == record.execution_id && s.step_id == record.step_id)
        {
            *existing = record.clone();
        } else {
            state.steps.push(record.clone());
        }
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let state = self.state.lock();
        let mut steps: Vec<StepRecord> = state
            .steps
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for same-millisecond steps.
        steps.sort_by_key(|s| s.timestamp);
        Ok(steps)
    }

    async fn upsert_cron_execution(
        &self,
        record: &CronExecutionRecord,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .cron_executions
            .insert(record.function_id.clone(), record.clone());
        Ok(())
    }

    async fn find_cron_execution(
        &self,
        function_id: &str,
    ) -> Result<Option<CronExecutionRecord>, StoreError> {
        Ok(self.state.lock().cron_executions.get(function_id).cloned())
    }
}
