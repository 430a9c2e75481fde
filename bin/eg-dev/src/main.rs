//! Eventgate Development Monolith
//!
//! All-in-one binary for local development: the ingress gateway plus the
//! Organization, User and Store services, wired over the in-memory broker
//! and in-memory document stores. No external broker or database needed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use eg_broker::{InMemoryBroker, ReplyPump, ReplyRegistry};
use eg_common::{GatewayConfig, RetryPolicy, ServiceConfig};
use eg_domain::{events, organization_service, queues, store_service, user_service};
use eg_gateway::{create_router, ApiState, GatewayRouter};
use eg_routing::{DeliveryMode, RouteEntry, RoutingHandle, RoutingTable};
use eg_service::ServiceDeps;
use eg_store::InMemoryDocumentStore;

/// Eventgate Development Server
#[derive(Parser, Debug)]
#[command(name = "eg-dev")]
#[command(about = "Eventgate Development Monolith - all components in one binary")]
struct Args {
    /// API server port
    #[arg(long, env = "EG_API_PORT", default_value = "8080")]
    api_port: u16,

    /// Worker slots per domain service
    #[arg(long, env = "EG_WORKERS", default_value = "4")]
    workers: usize,

    /// Request-reply deadline for gateway operations, in milliseconds
    #[arg(long, env = "EG_REPLY_TIMEOUT_MS", default_value = "10000")]
    reply_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    info!("Starting Eventgate Dev Monolith");
    info!("API port: {}", args.api_port);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 1. In-memory broker and per-service stores
    let broker = InMemoryBroker::new();
    let orgs = Arc::new(InMemoryDocumentStore::new("organizations"));
    let users = Arc::new(InMemoryDocumentStore::new("users"));
    let stores = Arc::new(InMemoryDocumentStore::new("stores"));
    let owners = Arc::new(InMemoryDocumentStore::new("store_owners"));

    let service_config = |queue: &str| {
        ServiceConfig::for_queue(queue)
            .with_workers(args.workers)
            .with_retry(RetryPolicy::new(5, 200, 5_000))
            .with_reference_retry(RetryPolicy::new(5, 300, 5_000))
            .with_request_timeout(Duration::from_secs(3))
    };
    let service_deps = |queue: &str, store: Arc<InMemoryDocumentStore>| ServiceDeps {
        consumer: broker.consumer(queue),
        reply_consumer: broker.consumer(&format!("{}.replies", queue)),
        publisher: broker.publisher(),
        store,
    };

    // 2. Domain services, explicitly constructed
    let runtimes = vec![
        organization_service(
            service_config(queues::ORGANIZATION),
            service_deps(queues::ORGANIZATION, orgs),
        )?,
        user_service(service_config(queues::USER), service_deps(queues::USER, users))?,
        store_service(
            service_config(queues::STORE),
            service_deps(queues::STORE, stores),
            owners,
        )?,
    ];

    let mut runtime_handles = Vec::new();
    for runtime in &runtimes {
        runtime_handles.push(tokio::spawn(runtime.clone().run()));
    }

    // 3. Gateway over the same broker
    let table = RoutingTable::from_entries(default_routes())?;
    info!(operations = ?table.operations(), "Routing table ready");

    let registry = ReplyRegistry::new();
    let pump = ReplyPump::spawn(
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
            reply_timeout: Duration::from_millis(args.reply_timeout_ms),
        },
    ));

    // 4. HTTP ingress
    let app = create_router(ApiState {
        router: gateway,
        routing_path: None,
    })
    .layer(TraceLayer::new_for_http())
    .layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr = format!("0.0.0.0:{}", args.api_port);
    info!("API server listening on http://{}", addr);
    let listener = TcpListener::bind(&addr).await?;

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("API server shutting down");
            });
            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Eventgate Dev Monolith started successfully");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    let _ = shutdown_tx.send(());
    for runtime in &runtimes {
        runtime.shutdown().await;
    }

    let shutdown_timeout = Duration::from_secs(30);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = server_handle.await;
        let _ = pump.await;
        for handle in runtime_handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("Eventgate Dev Monolith shutdown complete");
    Ok(())
}

fn default_routes() -> Vec<RouteEntry> {
    let route = |operation: &str, queue: &str, required: &[&str]| RouteEntry {
        operation: operation.to_string(),
        queue: queue.to_string(),
        event: operation.to_string(),
        mode: DeliveryMode::RequestReply,
        required: required.iter().map(|s| s.to_string()).collect(),
    };

    vec![
        route(events::CREATE_ORGANIZATION, queues::ORGANIZATION, &["name"]),
        route(
            events::CREATE_USER,
            queues::USER,
            &["email", "name", "organization_id"],
        ),
        route(
            events::CREATE_STORE,
            queues::STORE,
            &["name", "owner_id"],
        ),
        route(events::GET_ORGANIZATION, queues::ORGANIZATION, &["id"]),
        route(events::GET_USER, queues::USER, &["id"]),
        route(events::GET_STORE, queues::STORE, &["id"]),
    ]
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
