//! Scheduler behavior against the in-memory backends: firing cadence,
//! leader election, takeover, and missed-run replay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use stepflow_core::{now_millis, CronExecutionRecord, EventBus, ExecutionStatus, LifecycleEvent};
use stepflow_engine::{Client, FunctionHandler, Handler};
use stepflow_scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use stepflow_storage::{DocStore, MemoryDocStore, MemoryQueueStore, QueueKeys};

fn tick_handler(id: &str, cron: &str) -> Arc<dyn Handler> {
    Arc::new(
        FunctionHandler::new(id, |_ctx| async { Ok(Value::Null) }).with_cron(cron),
    )
}

struct Fixture {
    queue: MemoryQueueStore,
    docs: MemoryDocStore,
    bus: EventBus,
    client: Arc<Client>,
}

async fn fixture_on(queue: MemoryQueueStore, docs: MemoryDocStore) -> Fixture {
    let bus = EventBus::new();
    let client = Arc::new(Client::new(
        Arc::new(queue.clone()),
        Arc::new(docs.clone()),
        QueueKeys::default(),
        bus.clone(),
    ));
    client.handshake().await.expect("handshake");
    Fixture {
        queue,
        docs,
        bus,
        client,
    }
}

async fn fixture() -> Fixture {
    fixture_on(MemoryQueueStore::new(), MemoryDocStore::new()).await
}

impl Fixture {
    fn scheduler(
        &self,
        handlers: &[Arc<dyn Handler>],
        config: SchedulerConfig,
    ) -> Result<Scheduler, SchedulerError> {
        Scheduler::new(
            Arc::clone(&self.client),
            Arc::new(self.queue.clone()),
            Arc::new(self.docs.clone()),
            handlers,
            config,
            self.bus.clone(),
        )
    }

    /// Record every `schedule:triggered` as (execution_id, timestamp, is_missed).
    fn collect_triggers(&self) -> Arc<Mutex<Vec<(String, i64, bool)>>> {
        let triggers = Arc::new(Mutex::new(Vec::new()));
        {
            let triggers = Arc::clone(&triggers);
            self.bus.subscribe(move |event| {
                if let LifecycleEvent::ScheduleTriggered {
                    execution_id,
                    timestamp,
                    is_missed,
                    ..
                } = event
                {
                    triggers.lock().push((execution_id.clone(), *timestamp, *is_missed));
                }
            });
        }
        triggers
    }
}

fn fast_election() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_leader_check_interval(Duration::from_millis(25))
        .with_leader_ttl(Duration::from_secs(10))
}

#[tokio::test]
async fn rejects_construction_without_scheduled_handlers() {
    let f = fixture().await;
    let unscheduled: Arc<dyn Handler> =
        Arc::new(FunctionHandler::new("plain", |_ctx| async { Ok(Value::Null) }));
    let outcome = f.scheduler(&[unscheduled], SchedulerConfig::default());
    assert!(matches!(outcome, Err(SchedulerError::NoScheduledHandlers)));
}

#[tokio::test]
async fn rejects_invalid_cron_at_construction() {
    let f = fixture().await;
    let broken = tick_handler("broken", "every tuesday");
    let outcome = f.scheduler(&[broken], SchedulerConfig::default());
    assert!(matches!(outcome, Err(SchedulerError::InvalidCron { .. })));
}

#[tokio::test]
async fn fires_every_second_and_submits_executions() {
    let f = fixture().await;
    let triggers = f.collect_triggers();
    let scheduler = f
        .scheduler(&[tick_handler("tick", "* * * * * *")], fast_election())
        .unwrap();
    scheduler.start().await.unwrap();

    // Two firings of an every-second cron need a little over two seconds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while triggers.lock().len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    scheduler.stop().await.unwrap();

    let fired = triggers.lock().clone();
    assert!(fired.len() >= 2, "expected at least two firings");
    let gap = fired[1].1 - fired[0].1;
    assert!(
        (400..=1600).contains(&gap),
        "firings should be about a second apart, got {gap} ms"
    );

    // Each firing submitted a queued execution with an empty payload.
    let (execution_id, _, is_missed) = fired[0].clone();
    assert!(!is_missed);
    let record = f.docs.find_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Queued);
    assert_eq!(record.event_name, "tick");
    assert_eq!(record.event_data, json!({}).to_string());

    // And stamped the bookkeeping row.
    let cron_record = f.docs.find_cron_execution("tick").await.unwrap().unwrap();
    assert!(cron_record.last_execution_time > 0);
    assert_eq!(cron_record.cron_expression, "* * * * * *");
}

#[tokio::test]
async fn only_one_instance_leads() {
    let queue = MemoryQueueStore::new();
    let docs = MemoryDocStore::new();
    let f1 = fixture_on(queue.clone(), docs.clone()).await;
    let f2 = fixture_on(queue, docs).await;

    let s1 = f1
        .scheduler(&[tick_handler("tick", "0 0 3 * * *")], fast_election())
        .unwrap();
    let s2 = f2
        .scheduler(&[tick_handler("tick", "0 0 3 * * *")], fast_election())
        .unwrap();

    s1.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    s2.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(s1.is_leader());
    assert!(!s2.is_leader());

    s1.stop().await.unwrap();
    s2.stop().await.unwrap();
}

#[tokio::test]
async fn follower_takes_over_after_leader_releases() {
    let queue = MemoryQueueStore::new();
    let docs = MemoryDocStore::new();
    let f1 = fixture_on(queue.clone(), docs.clone()).await;
    let f2 = fixture_on(queue, docs).await;

    let s1 = f1
        .scheduler(&[tick_handler("tick", "0 0 3 * * *")], fast_election())
        .unwrap();
    let s2 = f2
        .scheduler(&[tick_handler("tick", "0 0 3 * * *")], fast_election())
        .unwrap();

    s1.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    s2.start().await.unwrap();
    assert!(s1.is_leader());

    // Stopping the leader deletes the key; the follower wins a later tick.
    s1.stop().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !s2.is_leader() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(s2.is_leader());

    s2.stop().await.unwrap();
}

#[tokio::test]
async fn missed_firing_is_replayed_once() {
    let f = fixture().await;

    // The function last fired a minute ago; a */10 cron definitely missed.
    f.docs
        .upsert_cron_execution(&CronExecutionRecord {
            function_id: "laggard".into(),
            last_execution_time: now_millis() - 60_000,
            next_scheduled_time: None,
            cron_expression: "*/10 * * * * *".into(),
            updated_at: now_millis() - 60_000,
        })
        .await
        .unwrap();

    let triggers = f.collect_triggers();
    let missed = Arc::new(Mutex::new(0usize));
    {
        let missed = Arc::clone(&missed);
        f.bus.subscribe(move |event| {
            if matches!(event, LifecycleEvent::ScheduleMissed { .. }) {
                *missed.lock() += 1;
            }
        });
    }

    let scheduler = f
        .scheduler(
            &[tick_handler("laggard", "*/10 * * * * *")],
            SchedulerConfig::new().with_leader_election(false),
        )
        .unwrap();
    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop().await.unwrap();

    let catch_ups: Vec<_> = triggers
        .lock()
        .iter()
        .filter(|(_, _, is_missed)| *is_missed)
        .cloned()
        .collect();
    assert_eq!(catch_ups.len(), 1, "exactly one catch-up firing");
    assert_eq!(*missed.lock(), 1);

    // The catch-up stamped a fresh last-fire, so it will not replay again.
    let record = f.docs.find_cron_execution("laggard").await.unwrap().unwrap();
    assert!(record.last_execution_time >= now_millis() - 5_000);
}

#[tokio::test]
async fn function_that_never_ran_gets_no_catchup() {
    let f = fixture().await;
    let triggers = f.collect_triggers();

    let scheduler = f
        .scheduler(
            &[tick_handler("fresh", "*/10 * * * * *")],
            SchedulerConfig::new().with_leader_election(false),
        )
        .unwrap();
    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop().await.unwrap();

    assert!(
        triggers.lock().iter().all(|(_, _, is_missed)| !is_missed),
        "a function with no history must not be caught up"
    );
}

#[tokio::test]
async fn double_start_and_stop_are_lifecycle_errors() {
    let f = fixture().await;
    let scheduler = f
        .scheduler(
            &[tick_handler("tick", "0 0 3 * * *")],
            SchedulerConfig::new().with_leader_election(false),
        )
        .unwrap();

    scheduler.start().await.unwrap();
    assert!(matches!(
        scheduler.start().await,
        Err(SchedulerError::AlreadyRunning)
    ));
    scheduler.stop().await.unwrap();
    assert!(matches!(
        scheduler.stop().await,
        Err(SchedulerError::NotRunning)
    ));
}
