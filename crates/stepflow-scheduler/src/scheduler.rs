//! Leader-elected cron scheduler
//!
//! One leader key with a TTL arbitrates firing rights across scheduler
//! instances. The holder refreshes the TTL on every election tick; losing
//! the key (crash, partition, expiry) silently promotes some follower on its
//! next tick. Only the leader runs cron timers; a follower's timers are
//! never started, so a firing can come from at most one instance at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use stepflow_core::{now_millis, CronExecutionRecord, EventBus, LifecycleEvent};
use stepflow_engine::{Client, Handler, SubmitRequest};
use stepflow_storage::{DocStore, QueueKeys, QueueStore};

use crate::cron::CronSchedule;
use crate::error::SchedulerError;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Run leader election; when disabled this instance always fires.
    pub leader_election: bool,

    /// Lifetime of the leader key between refreshes.
    pub leader_ttl: Duration,

    /// Election tick: TTL refresh for the leader, acquisition attempt for
    /// followers.
    pub leader_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            leader_election: true,
            leader_ttl: Duration::from_secs(60),
            leader_check_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leader_election(mut self, enabled: bool) -> Self {
        self.leader_election = enabled;
        self
    }

    pub fn with_leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = ttl;
        self
    }

    pub fn with_leader_check_interval(mut self, interval: Duration) -> Self {
        self.leader_check_interval = interval;
        self
    }
}

struct ScheduledFunction {
    id: String,
    schedule: CronSchedule,
}

struct SchedulerInner {
    client: Arc<Client>,
    queue: Arc<dyn QueueStore>,
    docs: Arc<dyn DocStore>,
    keys: QueueKeys,
    config: SchedulerConfig,
    functions: Vec<Arc<ScheduledFunction>>,
    bus: EventBus,
    run_tx: watch::Sender<bool>,
    leader_tx: watch::Sender<bool>,
    /// Opaque value written to the leader key.
    instance_id: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cron scheduler over a set of handlers with cron expressions.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(client, queue, docs, &handlers,
///     SchedulerConfig::default(), bus)?;
/// scheduler.start().await?;
/// ```
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    running: AtomicBool,
}

impl Scheduler {
    /// Validate every handler's cron expression and build the scheduler.
    ///
    /// Handlers without a cron are ignored; construction fails when none
    /// carries one, or when any expression is invalid.
    pub fn new(
        client: Arc<Client>,
        queue: Arc<dyn QueueStore>,
        docs: Arc<dyn DocStore>,
        handlers: &[Arc<dyn Handler>],
        config: SchedulerConfig,
        bus: EventBus,
    ) -> Result<Self, SchedulerError> {
        let mut functions = Vec::new();
        for handler in handlers {
            if let Some(expression) = handler.cron() {
                functions.push(Arc::new(ScheduledFunction {
                    id: handler.id().to_string(),
                    schedule: CronSchedule::parse(expression)?,
                }));
            }
        }
        if functions.is_empty() {
            return Err(SchedulerError::NoScheduledHandlers);
        }

        let keys = client.keys().clone();
        let (run_tx, _) = watch::channel(false);
        let (leader_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                client,
                queue,
                docs,
                keys,
                config,
                functions,
                bus,
                run_tx,
                leader_tx,
                instance_id: uuid::Uuid::new_v4().simple().to_string(),
                tasks: Mutex::new(Vec::new()),
            }),
            running: AtomicBool::new(false),
        })
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _ = self.inner.run_tx.send(true);

        for function in &self.inner.functions {
            self.inner.bus.emit(LifecycleEvent::ScheduleRegistered {
                function_id: function.id.clone(),
            });
        }
        info!(
            functions = self.inner.functions.len(),
            leader_election = self.inner.config.leader_election,
            "scheduler started"
        );

        if self.inner.config.leader_election {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(election_loop(inner));
            self.inner.tasks.lock().push(handle);
        } else {
            become_leader(&self.inner).await;
        }
        Ok(())
    }

    /// Stop timers, release leadership if held, emit `stopped`.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        let was_leader = *self.inner.leader_tx.subscribe().borrow();
        let _ = self.inner.run_tx.send(false);
        let _ = self.inner.leader_tx.send(false);

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        if was_leader {
            if let Err(e) = self.inner.queue.delete(&self.inner.keys.leader()).await {
                warn!("failed to release leader key: {}", e);
            }
        }

        self.inner.bus.emit(LifecycleEvent::Stopped);
        info!("scheduler stopped");
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.leader_tx.subscribe().borrow()
    }
}

/// Election tick loop. The first tick fires immediately, so a fresh
/// instance on an uncontested deployment leads without waiting a full
/// check interval.
async fn election_loop(inner: Arc<SchedulerInner>) {
    let leader_key = inner.keys.leader();
    let mut run_rx = inner.run_tx.subscribe();
    let mut ticker = tokio::time::interval(inner.config.leader_check_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                election_tick(&inner, &leader_key).await;
            }
            _ = run_rx.changed() => {
                if !*run_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("election loop exited");
}

async fn election_tick(inner: &Arc<SchedulerInner>, leader_key: &str) {
    let is_leader = *inner.leader_tx.subscribe().borrow();
    if is_leader {
        match inner.queue.remaining_ttl(leader_key).await {
            Ok(ttl) if ttl > 0 => {
                if let Err(e) = inner
                    .queue
                    .extend_ttl(leader_key, inner.config.leader_ttl)
                    .await
                {
                    warn!("failed to refresh leader key: {}", e);
                }
            }
            Ok(_) => {
                warn!("leader key expired, demoting");
                let _ = inner.leader_tx.send(false);
                inner.bus.emit(LifecycleEvent::LeaderLost);
            }
            Err(e) => {
                warn!("failed to read leader key ttl: {}", e);
            }
        }
    } else {
        match inner
            .queue
            .set_if_absent_with_ttl(leader_key, &inner.instance_id, inner.config.leader_ttl)
            .await
        {
            Ok(true) => {
                info!("leadership acquired");
                become_leader(inner).await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("leader acquisition attempt failed: {}", e);
            }
        }
    }
}

/// Start firing: emit `leader:acquired`, spawn the per-function timers, then
/// replay missed firings once.
async fn become_leader(inner: &Arc<SchedulerInner>) {
    inner.bus.emit(LifecycleEvent::LeaderAcquired);
    let _ = inner.leader_tx.send(true);

    {
        let mut tasks = inner.tasks.lock();
        for function in &inner.functions {
            let inner = Arc::clone(inner);
            let function = Arc::clone(function);
            tasks.push(tokio::spawn(timer_loop(inner, function)));
        }
    }

    replay_missed(inner).await;
}

/// One cron timer. Exits on scheduler stop or leadership loss; a later
/// re-acquisition spawns a fresh loop.
async fn timer_loop(inner: Arc<SchedulerInner>, function: Arc<ScheduledFunction>) {
    let mut run_rx = inner.run_tx.subscribe();
    let mut leader_rx = inner.leader_tx.subscribe();
    debug!(function_id = %function.id, cron = function.schedule.expression(), "cron timer started");

    loop {
        if !*run_rx.borrow() || !*leader_rx.borrow() {
            break;
        }
        let now = Utc::now();
        let Some(next) = function.schedule.next_fire_after(now) else {
            warn!(function_id = %function.id, "schedule has no upcoming fire");
            break;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if !*run_rx.borrow() || !*leader_rx.borrow() {
                    break;
                }
                fire(&inner, &function, false).await;
            }
            _ = leader_rx.changed() => {}
            _ = run_rx.changed() => {}
        }
    }
    debug!(function_id = %function.id, "cron timer exited");
}

/// Submit one scheduled invocation and stamp the bookkeeping record.
async fn fire(inner: &Arc<SchedulerInner>, function: &ScheduledFunction, is_missed: bool) {
    let now = now_millis();
    // Scheduled handlers read no event data; the payload is empty by
    // convention.
    let request = SubmitRequest::new(function.id.clone(), json!({}));

    match inner.client.submit(request).await {
        Ok(execution_id) => {
            let next_scheduled_time = function
                .schedule
                .next_fire_after(Utc::now())
                .map(|t| t.timestamp_millis());
            let record = CronExecutionRecord {
                function_id: function.id.clone(),
                last_execution_time: now,
                next_scheduled_time,
                cron_expression: function.schedule.expression().to_string(),
                updated_at: now,
            };
            if let Err(e) = inner.docs.upsert_cron_execution(&record).await {
                warn!(function_id = %function.id, "failed to stamp cron execution: {}", e);
                inner.bus.emit(LifecycleEvent::Error {
                    message: format!("failed to stamp cron execution: {e}"),
                });
            }

            inner.bus.emit(LifecycleEvent::ScheduleTriggered {
                function_id: function.id.clone(),
                execution_id,
                timestamp: now,
                is_missed,
            });
            debug!(function_id = %function.id, is_missed, "schedule fired");
        }
        Err(e) => {
            error!(function_id = %function.id, "scheduled submission failed: {}", e);
            inner.bus.emit(LifecycleEvent::Error {
                message: format!("scheduled submission failed: {e}"),
            });
        }
    }
}

/// One-shot catch-up on leadership acquisition: at most one replayed firing
/// per function, no matter how long the deployment was leaderless. A
/// function with no bookkeeping row never ran, so there is nothing to be
/// late against.
async fn replay_missed(inner: &Arc<SchedulerInner>) {
    let now = now_millis();
    for function in &inner.functions {
        match inner.docs.find_cron_execution(&function.id).await {
            Ok(Some(record)) => {
                if function
                    .schedule
                    .should_have_run(record.last_execution_time, now)
                {
                    info!(function_id = %function.id, "replaying missed firing");
                    inner.bus.emit(LifecycleEvent::ScheduleMissed {
                        function_id: function.id.clone(),
                    });
                    fire(inner, function, true).await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(function_id = %function.id, "missed-run lookup failed: {}", e);
            }
        }
    }
}
