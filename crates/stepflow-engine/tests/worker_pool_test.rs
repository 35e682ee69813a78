//! End-to-end worker pool tests against the in-memory backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use stepflow_core::{now_millis, EventBus, ExecutionRecord, ExecutionStatus, LifecycleEvent};
use stepflow_engine::{
    Client, FunctionHandler, Handler, SubmitRequest, WorkerPool, WorkerPoolConfig,
};
use stepflow_storage::{DocStore, MemoryDocStore, MemoryQueueStore, QueueKeys, QueueStore};

struct Harness {
    queue: MemoryQueueStore,
    docs: MemoryDocStore,
    bus: EventBus,
    client: Client,
    keys: QueueKeys,
}

async fn harness() -> Harness {
    let queue = MemoryQueueStore::new();
    let docs = MemoryDocStore::new();
    let bus = EventBus::new();
    let keys = QueueKeys::default();
    let client = Client::new(
        Arc::new(queue.clone()),
        Arc::new(docs.clone()),
        keys.clone(),
        bus.clone(),
    );
    client.handshake().await.expect("handshake");
    Harness {
        queue,
        docs,
        bus,
        client,
        keys,
    }
}

impl Harness {
    fn pool(&self, handlers: Vec<Arc<dyn Handler>>, concurrency: usize) -> WorkerPool {
        WorkerPool::new(
            Arc::new(self.queue.clone()),
            Arc::new(self.docs.clone()),
            handlers,
            WorkerPoolConfig::new()
                .with_concurrency(concurrency)
                .with_pop_timeout(Duration::from_millis(50)),
            self.bus.clone(),
        )
        .expect("pool construction")
    }
}

async fn wait_for_status(
    docs: &MemoryDocStore,
    id: &str,
    status: ExecutionStatus,
) -> ExecutionRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = docs.find_execution(id).await.expect("find execution") {
            if record.status == status {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for execution {id} to reach {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_step_event_completes() {
    let h = harness().await;
    let handler: Arc<dyn Handler> =
        Arc::new(FunctionHandler::new("simple-event", |ctx| async move {
            let value = ctx.event.data["value"]
                .as_str()
                .unwrap_or_default()
                .to_uppercase();
            ctx.step
                .run("uppercase value", move || async move {
                    Ok(json!({ "processed": value }))
                })
                .await
        }));

    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let id = h
        .client
        .submit(SubmitRequest::new("simple-event", json!({"value": "hello"})))
        .await
        .unwrap();

    let record = wait_for_status(&h.docs, &id, ExecutionStatus::Completed).await;
    assert_eq!(record.result, Some(json!({"processed": "HELLO"})));
    assert_eq!(record.attempt_count, 0);

    let steps = h.docs.list_steps(&id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].result, json!({"processed": "HELLO"}));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn multi_step_sequence_checkpoints_in_order() {
    let h = harness().await;
    let handler: Arc<dyn Handler> =
        Arc::new(FunctionHandler::new("counter-event", |ctx| async move {
            let count = ctx.event.data["count"].as_i64().unwrap_or_default();
            let added: i64 = ctx
                .step
                .run("add ten", move || async move { Ok(count + 10) })
                .await?;
            let doubled: i64 = ctx
                .step
                .run("double", move || async move { Ok(added * 2) })
                .await?;
            let reduced: i64 = ctx
                .step
                .run("subtract five", move || async move { Ok(doubled - 5) })
                .await?;
            Ok(json!({ "result": reduced }))
        }));

    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let id = h
        .client
        .submit(SubmitRequest::new("counter-event", json!({"count": 5})))
        .await
        .unwrap();

    let record = wait_for_status(&h.docs, &id, ExecutionStatus::Completed).await;
    assert_eq!(record.result, Some(json!({"result": 25})));

    let steps = h.docs.list_steps(&id).await.unwrap();
    let results: Vec<Value> = steps.iter().map(|s| s.result.clone()).collect();
    assert_eq!(results, vec![json!(15), json!(30), json!(25)]);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_pool_processes_each_event_exactly_once() {
    let h = harness().await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler: Arc<dyn Handler> = {
        let invocations = Arc::clone(&invocations);
        Arc::new(FunctionHandler::new("fanout-event", move |ctx| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                let first: i64 = ctx.step.run("first", || async { Ok(1) }).await?;
                let second: i64 = ctx
                    .step
                    .run("second", move || async move { Ok(first + 1) })
                    .await?;
                Ok(json!({ "total": second }))
            }
        }))
    };

    let pool = h.pool(vec![handler], 3);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = h
            .client
            .submit(SubmitRequest::new("fanout-event", json!({"n": n})))
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        let record = wait_for_status(&h.docs, id, ExecutionStatus::Completed).await;
        assert_eq!(record.result, Some(json!({"total": 2})));
        assert_eq!(h.docs.list_steps(id).await.unwrap().len(), 2);
    }
    // One handler invocation per event, two unique step rows per execution.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(h.docs.step_count(), 6);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn orphaned_processing_execution_is_recovered() {
    let h = harness().await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler: Arc<dyn Handler> = {
        let invocations = Arc::clone(&invocations);
        Arc::new(FunctionHandler::new("orphan-event", move |_ctx| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"recovered": true}))
            }
        }))
    };

    // An execution a crashed worker left mid-flight: present in both stores
    // with status processing, absent from the queue.
    let mut record = ExecutionRecord::queued(
        "orphan-1".into(),
        "orphan-event".into(),
        json!({}).to_string(),
        now_millis(),
    );
    record.status = ExecutionStatus::Processing;
    h.docs.insert_execution(&record).await.unwrap();
    h.queue
        .hash_set(&h.keys.execution(&record.id), &record.to_kv_fields())
        .await
        .unwrap();
    assert_eq!(h.queue.list_len(&h.keys.queue()), 0);

    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let record = wait_for_status(&h.docs, "orphan-1", ExecutionStatus::Completed).await;
    assert_eq!(record.result, Some(json!({"recovered": true})));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn stop_drains_in_flight_executions() {
    let h = harness().await;
    let handler: Arc<dyn Handler> = Arc::new(FunctionHandler::new("slow-event", |_ctx| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!("done"))
    }));

    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let id = h
        .client
        .submit(SubmitRequest::new("slow-event", json!({})))
        .await
        .unwrap();
    wait_for_status(&h.docs, &id, ExecutionStatus::Processing).await;

    // Stop must wait for the running handler, not cancel it.
    pool.stop().await.unwrap();
    let record = h.docs.find_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test]
async fn unknown_event_name_fails_without_retry() {
    let h = harness().await;
    let handler: Arc<dyn Handler> =
        Arc::new(FunctionHandler::new("known-event", |_ctx| async {
            Ok(Value::Null)
        }));

    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let id = h
        .client
        .submit(SubmitRequest::new("mystery-event", json!({})))
        .await
        .unwrap();

    let record = wait_for_status(&h.docs, &id, ExecutionStatus::Failed).await;
    assert!(record
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("no handler registered"));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn unparseable_payload_fails_without_retry() {
    let h = harness().await;
    let handler: Arc<dyn Handler> =
        Arc::new(FunctionHandler::new("simple-event", |_ctx| async {
            Ok(Value::Null)
        }));

    // Bypass the client to plant a corrupt payload in both stores.
    let record = ExecutionRecord::queued(
        "corrupt-1".into(),
        "simple-event".into(),
        "{not json".into(),
        now_millis(),
    );
    h.docs.insert_execution(&record).await.unwrap();
    h.queue
        .hash_set(&h.keys.execution(&record.id), &record.to_kv_fields())
        .await
        .unwrap();
    h.queue
        .list_push_right(&h.keys.queue(), &record.id)
        .await
        .unwrap();

    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let record = wait_for_status(&h.docs, "corrupt-1", ExecutionStatus::Failed).await;
    assert!(record
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("unparseable event payload"));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_events_are_ordered_per_execution() {
    let h = harness().await;
    let seen: Arc<parking_lot::Mutex<Vec<LifecycleEvent>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        h.bus.subscribe(move |event| match event {
            LifecycleEvent::ExecutionStart { .. }
            | LifecycleEvent::ExecutionComplete { .. }
            | LifecycleEvent::ExecutionUpdated { .. }
            | LifecycleEvent::StepComplete { .. } => seen.lock().push(event.clone()),
            _ => {}
        });
    }

    let handler: Arc<dyn Handler> =
        Arc::new(FunctionHandler::new("observed-event", |ctx| async move {
            ctx.step.run("only step", || async { Ok(json!(1)) }).await
        }));
    let pool = h.pool(vec![handler], 1);
    pool.handshake().await.unwrap();
    pool.start().await.unwrap();

    let id = h
        .client
        .submit(SubmitRequest::new("observed-event", json!({})))
        .await
        .unwrap();
    wait_for_status(&h.docs, &id, ExecutionStatus::Completed).await;
    pool.stop().await.unwrap();

    let events = seen.lock().clone();
    assert!(matches!(
        events.first(),
        Some(LifecycleEvent::ExecutionStart { execution_id, .. }) if *execution_id == id
    ));
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::ExecutionUpdated {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
    let complete_idx = events
        .iter()
        .position(|e| matches!(e, LifecycleEvent::ExecutionComplete { .. }))
        .expect("execution:complete emitted");
    assert_eq!(complete_idx, events.len() - 2);
}
