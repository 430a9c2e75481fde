//! Runtime dispatch tests: unknown events, retry/dead-letter policy,
//! idempotent replay, and reply emission, all over the in-memory broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use eg_broker::{InMemoryBroker, QueueConsumer, QueuePublisher};
use eg_common::{Event, Reply, RetryPolicy, ServiceConfig};
use eg_service::{
    EventHandler, HandlerContext, HandlerError, HandlerRegistry, ServiceDeps, ServiceRuntime,
};
use eg_store::{DocumentStore, InMemoryDocumentStore};

fn test_config(queue: &str) -> ServiceConfig {
    ServiceConfig::for_queue(queue)
        .with_workers(2)
        .with_retry(RetryPolicy::new(3, 10, 50))
        .with_reference_retry(RetryPolicy::new(3, 10, 50))
        .with_request_timeout(Duration::from_millis(200))
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryDocumentStore>,
    runtime: Arc<ServiceRuntime>,
    publisher: Arc<dyn QueuePublisher>,
}

impl Harness {
    fn start(queue: &str, handlers: HandlerRegistry) -> Self {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryDocumentStore::new(format!("{}s", queue)));
        let config = test_config(queue);

        let deps = ServiceDeps {
            consumer: broker.consumer(&config.queue),
            reply_consumer: broker.consumer(&config.reply_queue),
            publisher: broker.publisher(),
            store: store.clone(),
        };

        let runtime = ServiceRuntime::new(queue, config, deps, handlers);
        tokio::spawn(runtime.clone().run());

        Self {
            publisher: broker.publisher(),
            broker,
            store,
            runtime,
        }
    }

    async fn publish(&self, queue: &str, event: Event) {
        self.publisher.publish(queue, event).await.unwrap();
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Fails every invocation with the supplied error.
struct AlwaysFailHandler {
    calls: Arc<AtomicU32>,
    error: HandlerError,
}

#[async_trait]
impl EventHandler for AlwaysFailHandler {
    async fn handle(
        &self,
        _ctx: &HandlerContext,
        _event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Fails the first `fail_first` invocations transiently, then persists.
struct FlakyHandler {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(HandlerError::TransientStore("store unavailable".to_string()));
        }
        persist(ctx, event).await
    }
}

/// Persists the event payload as a document keyed by the idempotency token.
struct PersistHandler;

#[async_trait]
impl EventHandler for PersistHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        persist(ctx, event).await
    }
}

async fn persist(ctx: &HandlerContext, event: &Event) -> Result<Option<Value>, HandlerError> {
    let mut doc = event.payload.clone();
    if let Some(obj) = doc.as_object_mut() {
        if let Some(key) = &event.idempotency_key {
            obj.insert("_idempotency_key".to_string(), json!(key));
        }
    }
    let id = ctx.store.insert(doc).await?;
    let stored = ctx.store.find_by_id(&id).await?;
    Ok(stored)
}

#[tokio::test]
async fn unknown_event_is_acked_and_dropped() {
    let harness = Harness::start("widget", HandlerRegistry::new());

    harness
        .publish("widget", Event::new("mystery_event", json!({})))
        .await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.broker.queue_depth("widget") == 0
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.broker.dlq_depth("widget"), 0);
    assert!(harness.runtime.is_running());
}

#[tokio::test]
async fn validation_failure_dead_letters_on_first_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "create_widget",
            Arc::new(AlwaysFailHandler {
                calls: calls.clone(),
                error: HandlerError::validation("name must not be empty"),
            }),
        )
        .unwrap();

    let harness = Harness::start("widget", handlers);
    harness
        .publish("widget", Event::new("create_widget", json!({"name": ""})))
        .await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.broker.dlq_depth("widget") == 1
        })
        .await
    );

    // dead-lettered without any retry
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let dead = harness.broker.peek_queue("widget.dlq");
    assert_eq!(dead[0].attempt, 1);
}

#[tokio::test]
async fn transient_failure_retries_to_max_attempts_then_dead_letters() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "create_widget",
            Arc::new(AlwaysFailHandler {
                calls: calls.clone(),
                error: HandlerError::TransientStore("store down".to_string()),
            }),
        )
        .unwrap();

    let harness = Harness::start("widget", handlers);
    harness
        .publish("widget", Event::new("create_widget", json!({"name": "w"})))
        .await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            harness.broker.dlq_depth("widget") == 1
        })
        .await
    );

    // max_attempts total deliveries, then dead-letter
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead = harness.broker.peek_queue("widget.dlq");
    assert_eq!(dead[0].attempt, 3);
}

#[tokio::test]
async fn transient_failure_recovers_before_budget_is_spent() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "create_widget",
            Arc::new(FlakyHandler {
                calls: calls.clone(),
                fail_first: 2,
            }),
        )
        .unwrap();

    let harness = Harness::start("widget", handlers);
    harness
        .publish(
            "widget",
            Event::new("create_widget", json!({"_id": "w1", "name": "w"})),
        )
        .await;

    assert!(wait_until(Duration::from_secs(5), || harness.store.len() == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.broker.dlq_depth("widget"), 0);

    let stored = harness.store.find_by_id("w1").await.unwrap().unwrap();
    assert_eq!(stored["name"], "w");
}

#[tokio::test]
async fn replayed_event_with_same_idempotency_key_persists_once() {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("create_widget", Arc::new(PersistHandler))
        .unwrap();

    let harness = Harness::start("widget", handlers);

    let payload = json!({"name": "w"});
    let first = Event::new("create_widget", payload.clone())
        .with_idempotency_key(Some("tok-1".to_string()));
    let replay =
        Event::new("create_widget", payload).with_idempotency_key(Some("tok-1".to_string()));

    harness.publish("widget", first).await;
    harness.publish("widget", replay).await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.broker.queue_depth("widget") == 0 && harness.store.len() >= 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.store.len(), 1);
    assert_eq!(harness.broker.dlq_depth("widget"), 0);
}

#[tokio::test]
async fn success_reply_is_published_to_reply_queue() {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("create_widget", Arc::new(PersistHandler))
        .unwrap();

    let harness = Harness::start("widget", handlers);
    let caller = harness.broker.consumer("caller.replies");

    let event = Event::new("create_widget", json!({"_id": "w1", "name": "w"}))
        .with_correlation("corr-1".to_string(), "caller.replies".to_string());
    harness.publish("widget", event).await;

    let mut received = None;
    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.broker.queue_depth("caller.replies") > 0
        })
        .await
    );
    for queued in caller.poll(4).await.unwrap() {
        caller.ack(&queued.receipt_handle).await.unwrap();
        received = Some(queued.event);
    }

    let reply_evt = received.expect("reply event");
    assert_eq!(reply_evt.name, "create_widget.reply");
    let reply: Reply = serde_json::from_value(reply_evt.payload).unwrap();
    assert!(reply.ok);
    assert_eq!(reply.correlation_id, "corr-1");
    assert_eq!(reply.data.unwrap()["_id"], "w1");
}

#[tokio::test]
async fn failure_reply_carries_error_body_on_dead_letter() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            "create_widget",
            Arc::new(AlwaysFailHandler {
                calls,
                error: HandlerError::validation_fields(
                    "name must not be empty",
                    vec!["name".to_string()],
                ),
            }),
        )
        .unwrap();

    let harness = Harness::start("widget", handlers);
    let caller = harness.broker.consumer("caller.replies");

    let event = Event::new("create_widget", json!({"name": ""}))
        .with_correlation("corr-2".to_string(), "caller.replies".to_string());
    harness.publish("widget", event).await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.broker.queue_depth("caller.replies") > 0
        })
        .await
    );

    let queued = caller.poll(1).await.unwrap().remove(0);
    let reply: Reply = serde_json::from_value(queued.event.payload).unwrap();
    assert!(!reply.ok);
    let error = reply.error.unwrap();
    assert_eq!(error.kind, "VALIDATION");

    assert!(
        wait_until(Duration::from_secs(3), || {
            harness.broker.dlq_depth("widget") == 1
        })
        .await
    );
}
