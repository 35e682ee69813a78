//! Worker pool
//!
//! N independent dequeue loops over one shared queue. Each worker owns a
//! duplicated queue connection used only for the blocking pop; execution
//! metadata updates always ride the shared adapter, and each active
//! execution gets its own short-lived step connection. The atomic pop is the
//! linearization point: a queued id reaches exactly one worker, even across
//! processes.
//!
//! Connection policy matters here: a blocking pop parks its connection for
//! up to the pop timeout, and any state written through that connection
//! would stall behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use stepflow_core::execution::fields;
use stepflow_core::{
    now_millis, EventBus, ExecutionRecord, ExecutionStatus, LifecycleEvent,
};
use stepflow_storage::{
    DocStore, ExecutionFilter, ExecutionUpdate, QueueKeys, QueueStore, SortOrder, StoreError,
    DEFAULT_QUEUE_PREFIX,
};

use crate::error::EngineError;
use crate::handler::{EventEnvelope, Handler, HandlerContext};
use crate::step_runner::StepRunner;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of independent dequeue loops.
    pub concurrency: usize,

    /// Key namespace prefix shared with the producing client.
    pub queue_prefix: String,

    /// Blocking pop timeout; bounds how quickly a stop is noticed.
    pub pop_timeout: Duration,

    /// Poll granularity while draining in-flight executions on stop.
    pub drain_poll_interval: Duration,

    /// Verbose index bootstrap logging.
    pub logging: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            pop_timeout: Duration::from_secs(5),
            drain_poll_interval: Duration::from_millis(100),
            logging: false,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }
}

/// Worker pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Constructed; stores not yet verified.
    Created,
    /// Handshake completed, dequeue loops not yet running.
    Ready,
    Running,
    /// Stop requested; draining in-flight executions.
    Draining,
    Stopped,
}

struct PoolInner {
    queue: Arc<dyn QueueStore>,
    docs: Arc<dyn DocStore>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    keys: QueueKeys,
    config: WorkerPoolConfig,
    bus: EventBus,
    status: RwLock<PoolStatus>,
    run_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
}

impl PoolInner {
    fn running(&self) -> bool {
        *self.run_tx.subscribe().borrow()
    }

    fn emit_store_error(&self, context: &str, error: &StoreError) {
        error!("{context}: {error}");
        self.bus.emit(LifecycleEvent::Error {
            message: format!("{context}: {error}"),
        });
    }
}

/// Consumer side of the engine.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(queue, docs, handlers, WorkerPoolConfig::new()
///     .with_concurrency(4), bus)?;
/// pool.handshake().await?;
/// pool.start().await?;
/// // ... later
/// pool.stop().await?;
/// ```
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Build a pool over the given stores and handler set.
    ///
    /// Fails with [`EngineError::DuplicateHandler`] when two handlers share
    /// an event name.
    pub fn new(
        queue: Arc<dyn QueueStore>,
        docs: Arc<dyn DocStore>,
        handlers: Vec<Arc<dyn Handler>>,
        config: WorkerPoolConfig,
        bus: EventBus,
    ) -> Result<Self, EngineError> {
        let mut registry: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for handler in handlers {
            let id = handler.id().to_string();
            if registry.insert(id.clone(), handler).is_some() {
                return Err(EngineError::DuplicateHandler(id));
            }
        }

        let keys = QueueKeys::new(config.queue_prefix.clone());
        let (run_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(PoolInner {
                queue,
                docs,
                handlers: registry,
                keys,
                config,
                bus,
                status: RwLock::new(PoolStatus::Created),
                run_tx,
                in_flight: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Startup handshake: verify both stores and bootstrap indexes, then
    /// emit `ready`.
    pub async fn handshake(&self) -> Result<(), EngineError> {
        match *self.inner.status.read() {
            PoolStatus::Created => {}
            PoolStatus::Ready => return Ok(()),
            _ => return Err(EngineError::AlreadyRunning),
        }

        futures::try_join!(self.inner.queue.ping(), self.inner.docs.ping())?;
        self.inner
            .docs
            .ensure_indexes(self.inner.config.logging)
            .await?;

        *self.inner.status.write() = PoolStatus::Ready;
        self.inner.bus.emit(LifecycleEvent::Ready);
        info!(
            concurrency = self.inner.config.concurrency,
            handlers = self.inner.handlers.len(),
            "worker pool ready"
        );
        Ok(())
    }

    /// Recover orphans, then spawn the dequeue loops.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        match *self.inner.status.read() {
            PoolStatus::Ready => {}
            PoolStatus::Created => return Err(EngineError::NotReady),
            PoolStatus::Running | PoolStatus::Draining => {
                return Err(EngineError::AlreadyRunning)
            }
            PoolStatus::Stopped => return Err(EngineError::NotRunning),
        }

        self.recover_orphans().await?;

        let _ = self.inner.run_tx.send(true);
        *self.inner.status.write() = PoolStatus::Running;

        let mut workers = self.workers.lock();
        for worker_idx in 0..self.inner.config.concurrency {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_idx)));
        }
        info!(workers = self.inner.config.concurrency, "worker pool started");
        Ok(())
    }

    /// Graceful drain: stop popping, let in-flight handlers finish, release
    /// the dequeue connections. Running handlers are never cancelled.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        {
            let mut status = self.inner.status.write();
            if *status != PoolStatus::Running {
                return Err(EngineError::NotRunning);
            }
            *status = PoolStatus::Draining;
        }
        let _ = self.inner.run_tx.send(false);

        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.inner.config.drain_poll_interval).await;
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        *self.inner.status.write() = PoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        *self.inner.status.read()
    }

    /// Number of executions currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Re-enqueue executions a crashed worker left in-flight.
    ///
    /// Runs once per pool start, before any dequeue loop. Two pools racing
    /// on the same orphan can double-enqueue it; the duplicate dequeue is
    /// harmless because the replayed handler serves its steps from the
    /// checkpoint cache.
    async fn recover_orphans(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let orphans = inner
            .docs
            .list_executions(&ExecutionFilter::in_flight(), SortOrder::Ascending, 0, 0)
            .await?;
        if orphans.is_empty() {
            return Ok(());
        }

        info!(count = orphans.len(), "recovering orphaned executions");
        for mut record in orphans {
            let now = now_millis();
            record.status = ExecutionStatus::Queued;
            record.updated_at = now;

            inner
                .queue
                .hash_set(&inner.keys.execution(&record.id), &record.to_kv_fields())
                .await?;
            inner
                .docs
                .update_execution(
                    &record.id,
                    &ExecutionUpdate::to_status(ExecutionStatus::Queued, now),
                )
                .await?;
            inner
                .queue
                .list_push_right(&inner.keys.queue(), &record.id)
                .await?;
            debug!(execution_id = %record.id, "orphan re-enqueued");
        }
        Ok(())
    }
}

/// One dequeue loop. Owns a dedicated duplicate of the queue connection;
/// spawns each popped execution so the next pop is not blocked behind it.
async fn worker_loop(inner: Arc<PoolInner>, worker_idx: usize) {
    let conn = match inner.queue.duplicate().await {
        Ok(conn) => conn,
        Err(e) => {
            inner.emit_store_error("failed to open dequeue connection", &e);
            return;
        }
    };

    let queue_key = inner.keys.queue();
    let run_rx = inner.run_tx.subscribe();
    let mut tasks: JoinSet<()> = JoinSet::new();
    debug!(worker_idx, "worker loop started");

    while *run_rx.borrow() {
        match conn
            .list_pop_left_blocking(&queue_key, inner.config.pop_timeout)
            .await
        {
            Ok(Some(id)) => {
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&inner);
                tasks.spawn(async move {
                    process_execution(&inner, &id).await;
                    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
                // Reap finished executions without blocking the loop.
                while tasks.try_join_next().is_some() {}
            }
            Ok(None) => {
                // Pop timeout; loop to re-check the run flag.
            }
            Err(e) => {
                inner.emit_store_error("dequeue failed", &e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    // Drain this worker's outstanding executions before releasing its
    // connection; disconnecting earlier would strand them mid-update.
    while tasks.join_next().await.is_some() {}
    if let Err(e) = conn.disconnect().await {
        warn!(worker_idx, "failed to release dequeue connection: {}", e);
    }
    debug!(worker_idx, "worker loop exited");
}

fn status_fields(status: ExecutionStatus, now: i64) -> Vec<(String, String)> {
    vec![
        (fields::STATUS.into(), status.to_string()),
        (fields::UPDATED_AT.into(), now.to_string()),
    ]
}

/// Run one popped execution through its handler.
#[instrument(skip(inner), fields(execution_id = %id))]
async fn process_execution(inner: &Arc<PoolInner>, id: &str) {
    let kv_key = inner.keys.execution(id);

    let hash = match inner.queue.hash_get_all(&kv_key).await {
        Ok(hash) => hash,
        Err(e) => {
            inner.emit_store_error("failed to load execution", &e);
            return;
        }
    };
    let record = match ExecutionRecord::from_kv_fields(id, &hash) {
        Ok(record) => record,
        Err(e) => {
            fail_without_retry(inner, id, &kv_key, format!("malformed execution record: {e}"))
                .await;
            return;
        }
    };
    let data = match record.parse_event_data() {
        Ok(data) => data,
        Err(e) => {
            fail_without_retry(inner, id, &kv_key, e.to_string()).await;
            return;
        }
    };
    let Some(handler) = inner.handlers.get(&record.event_name).cloned() else {
        fail_without_retry(
            inner,
            id,
            &kv_key,
            format!("no handler registered for event: {}", record.event_name),
        )
        .await;
        return;
    };

    let now = now_millis();
    let processing_fields = status_fields(ExecutionStatus::Processing, now);
    let processing_update = ExecutionUpdate::to_status(ExecutionStatus::Processing, now);
    let transition = futures::try_join!(
        inner.queue.hash_set(&kv_key, &processing_fields),
        inner.docs.update_execution(id, &processing_update),
    );
    if let Err(e) = transition {
        inner.emit_store_error("failed to mark execution processing", &e);
        return;
    }
    inner.bus.emit(LifecycleEvent::ExecutionStart {
        execution_id: id.to_string(),
        event_name: record.event_name.clone(),
        attempt_count: record.attempt_count,
    });
    inner.bus.emit(LifecycleEvent::ExecutionUpdated {
        execution_id: id.to_string(),
        status: ExecutionStatus::Processing,
        result: None,
        error: None,
        attempt_count: Some(record.attempt_count),
    });

    // Step cache traffic gets its own connection for this execution.
    let step_conn = match inner.queue.duplicate().await {
        Ok(conn) => conn,
        Err(e) => {
            inner.emit_store_error("failed to open step connection", &e);
            return;
        }
    };
    let runner = StepRunner::new(
        id,
        &inner.keys,
        Arc::clone(&step_conn),
        Arc::clone(&inner.docs),
        inner.bus.clone(),
    );
    let ctx = HandlerContext {
        event: EventEnvelope {
            name: record.event_name.clone(),
            data,
            id: id.to_string(),
            timestamp: record.created_at,
        },
        step: runner,
    };

    let outcome = handler.handle(ctx).await;
    match outcome {
        Ok(result) => complete_execution(inner, id, &kv_key, record.attempt_count, result).await,
        Err(error) => {
            fail_execution(inner, id, &kv_key, handler.as_ref(), record.attempt_count, error)
                .await
        }
    }

    if let Err(e) = step_conn.disconnect().await {
        warn!(execution_id = %id, "failed to release step connection: {}", e);
    }
}

async fn complete_execution(
    inner: &Arc<PoolInner>,
    id: &str,
    kv_key: &str,
    attempt_count: u32,
    result: serde_json::Value,
) {
    let now = now_millis();
    let mut kv_fields = status_fields(ExecutionStatus::Completed, now);
    kv_fields.push((fields::RESULT.into(), result.to_string()));
    let update = ExecutionUpdate {
        status: Some(ExecutionStatus::Completed),
        result: Some(result.clone()),
        updated_at: Some(now),
        ..Default::default()
    };

    let writes = futures::try_join!(
        inner.queue.hash_set(kv_key, &kv_fields),
        inner.docs.update_execution(id, &update),
    );
    if let Err(e) = writes {
        inner.emit_store_error("failed to persist completion", &e);
        return;
    }

    // Both stores have settled; observers may now rely on the record.
    inner.bus.emit(LifecycleEvent::ExecutionComplete {
        execution_id: id.to_string(),
        result: result.clone(),
    });
    inner.bus.emit(LifecycleEvent::ExecutionUpdated {
        execution_id: id.to_string(),
        status: ExecutionStatus::Completed,
        result: Some(result),
        error: None,
        attempt_count: Some(attempt_count),
    });
    info!(execution_id = %id, "execution completed");
}

async fn fail_execution(
    inner: &Arc<PoolInner>,
    id: &str,
    kv_key: &str,
    handler: &dyn Handler,
    fallback_attempt: u32,
    error: anyhow::Error,
) {
    let message = error.to_string();
    let stack = format!("{error:?}");

    // Reload for the authoritative attempt count; a concurrent duplicate
    // delivery may have advanced it since we loaded the record.
    let attempt_count = match inner.queue.hash_get_all(kv_key).await {
        Ok(hash) => ExecutionRecord::from_kv_fields(id, &hash)
            .map(|r| r.attempt_count)
            .unwrap_or(fallback_attempt),
        Err(_) => fallback_attempt,
    };

    let will_retry = attempt_count < handler.retries();
    let next_attempt = attempt_count + 1;
    let status = if will_retry {
        ExecutionStatus::Retrying
    } else {
        ExecutionStatus::Failed
    };

    let now = now_millis();
    let mut kv_fields = status_fields(status, now);
    kv_fields.push((fields::ERROR.into(), message.clone()));
    kv_fields.push((fields::ERROR_STACK.into(), stack.clone()));
    kv_fields.push((fields::ATTEMPT_COUNT.into(), next_attempt.to_string()));
    let update = ExecutionUpdate {
        status: Some(status),
        attempt_count: Some(next_attempt),
        error: Some(message.clone()),
        error_stack: Some(stack),
        updated_at: Some(now),
        ..Default::default()
    };

    let writes = futures::try_join!(
        inner.queue.hash_set(kv_key, &kv_fields),
        inner.docs.update_execution(id, &update),
    );
    if let Err(e) = writes {
        inner.emit_store_error("failed to persist failure", &e);
        return;
    }

    warn!(
        execution_id = %id,
        attempt = next_attempt,
        will_retry,
        "handler failed: {message}"
    );
    inner.bus.emit(LifecycleEvent::ExecutionFailed {
        execution_id: id.to_string(),
        error: message.clone(),
        attempt_count: next_attempt,
        will_retry,
    });
    inner.bus.emit(LifecycleEvent::ExecutionUpdated {
        execution_id: id.to_string(),
        status,
        result: None,
        error: Some(message),
        attempt_count: Some(next_attempt),
    });

    if will_retry && inner.running() {
        let inner = Arc::clone(inner);
        let id = id.to_string();
        let delay = handler.retry_delay();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // Retries scheduled before a stop but due after it are dropped.
            if !inner.running() {
                debug!(execution_id = %id, "pool stopped, dropping retry");
                return;
            }
            if let Err(e) = inner
                .queue
                .list_push_right(&inner.keys.queue(), &id)
                .await
            {
                inner.emit_store_error("failed to re-enqueue retry", &e);
            }
        });
    }
}

/// Terminal failure outside the retry policy: malformed records, unparseable
/// payloads and unknown event names have no handler to honor a retry count
/// for.
async fn fail_without_retry(inner: &Arc<PoolInner>, id: &str, kv_key: &str, message: String) {
    let now = now_millis();
    let mut kv_fields = status_fields(ExecutionStatus::Failed, now);
    kv_fields.push((fields::ERROR.into(), message.clone()));
    let update = ExecutionUpdate {
        status: Some(ExecutionStatus::Failed),
        error: Some(message.clone()),
        updated_at: Some(now),
        ..Default::default()
    };

    let writes = futures::try_join!(
        inner.queue.hash_set(kv_key, &kv_fields),
        inner.docs.update_execution(id, &update),
    );
    if let Err(e) = writes {
        inner.emit_store_error("failed to persist terminal failure", &e);
    }

    warn!(execution_id = %id, "execution failed without retry: {message}");
    inner.bus.emit(LifecycleEvent::ExecutionFailed {
        execution_id: id.to_string(),
        error: message.clone(),
        attempt_count: 0,
        will_retry: false,
    });
    inner.bus.emit(LifecycleEvent::ExecutionUpdated {
        execution_id: id.to_string(),
        status: ExecutionStatus::Failed,
        result: None,
        error: Some(message),
        attempt_count: None,
    });
}
