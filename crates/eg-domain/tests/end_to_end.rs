//! End-to-end tests: gateway → broker → domain services, all in-process.
//!
//! Covers the full ownership chain (Organization → User → Store), reference
//! verification ordering races, permanently unresolved references, and
//! gateway timeout behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use eg_broker::{InMemoryBroker, QueuePublisher, ReplyPump, ReplyRegistry};
use eg_common::{Event, GatewayConfig, RetryPolicy, ServiceConfig};
use eg_domain::{events, organization_service, queues, store_service, user_service};
use eg_gateway::{GatewayError, GatewayRouter, RouteOutcome};
use eg_routing::{DeliveryMode, RouteEntry, RoutingHandle, RoutingTable};
use eg_service::{ServiceDeps, ServiceRuntime};
use eg_store::{DocumentStore, InMemoryDocumentStore};

struct Stack {
    broker: Arc<InMemoryBroker>,
    orgs: Arc<InMemoryDocumentStore>,
    users: Arc<InMemoryDocumentStore>,
    stores: Arc<InMemoryDocumentStore>,
    owners: Arc<InMemoryDocumentStore>,
    gateway: Arc<GatewayRouter>,
    #[allow(dead_code)]
    runtimes: Vec<Arc<ServiceRuntime>>,
    #[allow(dead_code)]
    shutdown_tx: broadcast::Sender<()>,
}

fn service_config(queue: &str) -> ServiceConfig {
    ServiceConfig::for_queue(queue)
        .with_workers(2)
        .with_retry(RetryPolicy::new(4, 20, 200))
        .with_reference_retry(RetryPolicy::new(6, 30, 300))
        .with_request_timeout(Duration::from_millis(500))
}

fn route(operation: &str, queue: &str, mode: DeliveryMode, required: &[&str]) -> RouteEntry {
    RouteEntry {
        operation: operation.to_string(),
        queue: queue.to_string(),
        event: operation.to_string(),
        mode,
        required: required.iter().map(|s| s.to_string()).collect(),
    }
}

fn start_stack() -> Stack {
    let broker = InMemoryBroker::new();

    let orgs = Arc::new(InMemoryDocumentStore::new("organizations"));
    let users = Arc::new(InMemoryDocumentStore::new("users"));
    let stores = Arc::new(InMemoryDocumentStore::new("stores"));
    let owners = Arc::new(InMemoryDocumentStore::new("store_owners"));

    let deps = |queue: &str, store: Arc<InMemoryDocumentStore>| ServiceDeps {
        consumer: broker.consumer(queue),
        reply_consumer: broker.consumer(&format!("{}.replies", queue)),
        publisher: broker.publisher(),
        store,
    };

    let org_runtime = organization_service(
        service_config(queues::ORGANIZATION),
        deps(queues::ORGANIZATION, orgs.clone()),
    )
    .unwrap();
    let user_runtime =
        user_service(service_config(queues::USER), deps(queues::USER, users.clone())).unwrap();
    let store_runtime = store_service(
        service_config(queues::STORE),
        deps(queues::STORE, stores.clone()),
        owners.clone(),
    )
    .unwrap();

    let runtimes = vec![org_runtime, user_runtime, store_runtime];
    for runtime in &runtimes {
        tokio::spawn(runtime.clone().run());
    }

    let table = RoutingTable::from_entries(vec![
        route(
            events::CREATE_ORGANIZATION,
            queues::ORGANIZATION,
            DeliveryMode::RequestReply,
            &["name"],
        ),
        route(
            events::CREATE_USER,
            queues::USER,
            DeliveryMode::RequestReply,
            &["email", "name", "organization_id"],
        ),
        route(
            events::CREATE_STORE,
            queues::STORE,
            DeliveryMode::RequestReply,
            &["name", "owner_id"],
        ),
    ])
    .unwrap();

    let registry = ReplyRegistry::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    ReplyPump::spawn(
        broker.consumer("gateway.replies"),
        registry.clone(),
        shutdown_tx.subscribe(),
    );

    let gateway = Arc::new(GatewayRouter::new(
        RoutingHandle::new(table),
        broker.publisher(),
        registry,
        GatewayConfig {
            reply_queue: "gateway.replies".to_string(),
            reply_timeout: Duration::from_secs(3),
        },
    ));

    Stack {
        broker,
        orgs,
        users,
        stores,
        owners,
        gateway,
        runtimes,
        shutdown_tx,
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

async fn reply_of(stack: &Stack, operation: &str, input: Value) -> Value {
    match stack.gateway.route(operation, input).await.unwrap() {
        RouteOutcome::Reply(data) => data,
        other => panic!("expected Reply, got {:?}", other),
    }
}

#[tokio::test]
async fn acme_scenario_links_organization_user_and_store() {
    let stack = start_stack();

    let org = reply_of(&stack, "create_organization", json!({"name": "Acme"})).await;
    let org_id = org["_id"].as_str().unwrap().to_string();
    assert_eq!(org["name"], "Acme");

    let user = reply_of(
        &stack,
        "create_user",
        json!({"email": "a@acme.com", "name": "A", "organization_id": org_id}),
    )
    .await;
    let user_id = user["_id"].as_str().unwrap().to_string();
    assert_eq!(user["organization_id"], org_id.as_str());

    let store = reply_of(
        &stack,
        "create_store",
        json!({"name": "Acme Store", "owner_id": user_id}),
    )
    .await;
    assert_eq!(store["owner_id"], user_id.as_str());
    assert_eq!(store["name"], "Acme Store");

    assert_eq!(stack.orgs.len(), 1);
    assert_eq!(stack.users.len(), 1);
    assert_eq!(stack.stores.len(), 1);

    // the user_created announcement lands in the owner index
    assert!(
        wait_until(Duration::from_secs(3), || {
            stack.owners.len() == 1
        })
        .await
    );

    // nothing was dead-lettered along the way
    assert_eq!(stack.broker.dlq_depth(queues::ORGANIZATION), 0);
    assert_eq!(stack.broker.dlq_depth(queues::USER), 0);
    assert_eq!(stack.broker.dlq_depth(queues::STORE), 0);
}

#[tokio::test]
async fn user_created_before_its_organization_eventually_resolves() {
    let stack = start_stack();
    let publisher = stack.broker.publisher();

    // The user references an organization that does not exist yet.
    publisher
        .publish(
            queues::USER,
            Event::new(
                events::CREATE_USER,
                json!({"email": "a@acme.com", "name": "A", "organization_id": "o-race"}),
            ),
        )
        .await
        .unwrap();

    // The organization's creation event arrives moments later.
    tokio::time::sleep(Duration::from_millis(100)).await;
    publisher
        .publish(
            queues::ORGANIZATION,
            Event::new(
                events::CREATE_ORGANIZATION,
                json!({"id": "o-race", "name": "Acme"}),
            ),
        )
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || stack.users.len() == 1).await);

    let user = stack
        .users
        .find_by_idempotency_key("absent")
        .await
        .unwrap();
    assert!(user.is_none());

    let stored = stack.broker.peek_queue(queues::USER);
    assert!(stored.is_empty());
    assert_eq!(stack.broker.dlq_depth(queues::USER), 0);
}

#[tokio::test]
async fn permanently_missing_reference_is_dead_lettered() {
    let stack = start_stack();
    let publisher = stack.broker.publisher();

    publisher
        .publish(
            queues::USER,
            Event::new(
                events::CREATE_USER,
                json!({"email": "a@acme.com", "name": "A", "organization_id": "o-never"}),
            ),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            stack.broker.dlq_depth(queues::USER) == 1
        })
        .await
    );
    assert_eq!(stack.users.len(), 0);

    // the whole reference-retry budget was spent
    let dead = stack.broker.peek_queue("user.dlq");
    assert_eq!(dead[0].attempt, 6);
}

#[tokio::test]
async fn replaying_create_with_same_token_persists_one_organization() {
    let stack = start_stack();

    let body = json!({"name": "Acme", "idempotency_key": "create-acme-1"});
    let first = reply_of(&stack, "create_organization", body.clone()).await;
    let second = reply_of(&stack, "create_organization", body).await;

    assert_eq!(first["_id"], second["_id"]);
    assert_eq!(stack.orgs.len(), 1);
}

#[tokio::test]
async fn request_reply_with_no_consumer_times_out_within_deadline() {
    let stack = start_stack();

    // Dedicated gateway with a short deadline pointed at a queue nobody
    // consumes; no pump needed since no reply can ever arrive.
    let table = RoutingTable::from_entries(vec![route(
        "poke_void",
        "void",
        DeliveryMode::RequestReply,
        &[],
    )])
    .unwrap();
    let deadline = Duration::from_millis(250);
    let gateway = GatewayRouter::new(
        RoutingHandle::new(table),
        stack.broker.publisher(),
        ReplyRegistry::new(),
        GatewayConfig {
            reply_queue: "void.replies".to_string(),
            reply_timeout: deadline,
        },
    );

    let started = Instant::now();
    let err = gateway.route("poke_void", json!({})).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, GatewayError::Timeout { .. }));
    assert!(elapsed >= deadline);
    assert!(elapsed < deadline + Duration::from_secs(1));

    // the event is still on the queue; the publish is not retried or undone
    assert_eq!(stack.broker.queue_depth("void"), 1);
}
