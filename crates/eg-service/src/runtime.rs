//! ServiceRuntime - one domain service's consume/dispatch loop.
//!
//! Binds a single durable queue, dispatches each event to its registered
//! handler under bounded concurrency, and applies the per-failure delivery
//! policy:
//! - validation failure: dead-letter on first attempt, never retried
//! - transient failure: requeue with exponential backoff, then dead-letter
//! - unresolved reference: separate bounded retry budget (ordering races),
//!   then dead-letter
//!
//! Requeueing republishes the event with `attempt + 1` and a backoff delay,
//! then acks the original delivery, so the broker needs no native retry
//! counting. Handler-local failures never crash the service process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eg_broker::{QueueConsumer, QueuePublisher, ReplyPump, ReplyRegistry, Requester};
use eg_common::{
    error_kind, reply_event, ErrorBody, Event, QueuedEvent, Reply, RetryPolicy, ServiceConfig,
};
use eg_store::DocumentStore;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::registry::{HandlerContext, HandlerRegistry};
use crate::error::HandlerError;
use crate::Result;

const POLL_BATCH: usize = 16;
const IDLE_BACKOFF: Duration = Duration::from_millis(50);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker and store collaborators for one service runtime.
///
/// Explicit construction: everything a runtime touches is passed in here.
pub struct ServiceDeps {
    pub consumer: Arc<dyn QueueConsumer>,
    pub reply_consumer: Arc<dyn QueueConsumer>,
    pub publisher: Arc<dyn QueuePublisher>,
    pub store: Arc<dyn DocumentStore>,
}

pub struct ServiceRuntime {
    name: String,
    config: ServiceConfig,
    consumer: Arc<dyn QueueConsumer>,
    reply_consumer: Arc<dyn QueueConsumer>,
    publisher: Arc<dyn QueuePublisher>,
    handlers: Arc<HandlerRegistry>,
    ctx: Arc<HandlerContext>,
    reply_registry: Arc<ReplyRegistry>,
    workers: Arc<Semaphore>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceRuntime {
    pub fn new(
        name: impl Into<String>,
        config: ServiceConfig,
        deps: ServiceDeps,
        handlers: HandlerRegistry,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let reply_registry = ReplyRegistry::new();

        let requester = Arc::new(Requester::new(
            deps.publisher.clone(),
            reply_registry.clone(),
            config.reply_queue.clone(),
            config.request_timeout,
        ));

        let ctx = Arc::new(HandlerContext {
            store: deps.store,
            publisher: deps.publisher.clone(),
            requester,
        });

        Arc::new(Self {
            name: name.into(),
            workers: Arc::new(Semaphore::new(config.workers)),
            config,
            consumer: deps.consumer,
            reply_consumer: deps.reply_consumer,
            publisher: deps.publisher,
            handlers: Arc::new(handlers),
            ctx,
            reply_registry,
            running: AtomicBool::new(true),
            shutdown_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the consume/dispatch loop until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            service = %self.name,
            queue = %self.config.queue,
            workers = self.config.workers,
            handlers = ?self.handlers.event_names(),
            "Domain service runtime started"
        );

        // Correlated replies for this service's own verification requests.
        let pump = ReplyPump::spawn(
            self.reply_consumer.clone(),
            self.reply_registry.clone(),
            self.shutdown_tx.subscribe(),
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(service = %self.name, "Consumer loop shutting down");
                    break;
                }
                result = self.consumer.poll(POLL_BATCH) => {
                    match result {
                        Ok(batch) if !batch.is_empty() => {
                            for queued in batch {
                                let permit = match self.workers.clone().acquire_owned().await {
                                    Ok(p) => p,
                                    Err(_) => break,
                                };
                                let runtime = self.clone();
                                tokio::spawn(async move {
                                    runtime.process(queued).await;
                                    drop(permit);
                                });
                            }
                        }
                        Ok(_) => {
                            tokio::time::sleep(IDLE_BACKOFF).await;
                        }
                        Err(e) => {
                            error!(
                                service = %self.name,
                                queue = %self.config.queue,
                                error = %e,
                                "Error polling queue"
                            );
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        let _ = pump.await;
        Ok(())
    }

    /// Graceful shutdown: stop polling, drain in-flight handlers.
    pub async fn shutdown(&self) {
        info!(service = %self.name, "Service runtime shutting down...");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        self.consumer.stop().await;
        self.reply_consumer.stop().await;

        let slots = self.config.workers as u32;
        match tokio::time::timeout(DRAIN_TIMEOUT, self.workers.acquire_many(slots)).await {
            Ok(Ok(_)) => info!(service = %self.name, "All workers drained"),
            _ => warn!(service = %self.name, "Workers did not drain before timeout"),
        }

        info!(service = %self.name, "Service runtime shutdown complete");
    }

    async fn process(&self, queued: QueuedEvent) {
        let event = &queued.event;

        let Some(handler) = self.handlers.get(&event.name) else {
            // Unknown names are dropped, not fatal: queues see evolving
            // event vocabularies during rolling deploys.
            warn!(
                service = %self.name,
                event = %event.name,
                event_id = %event.id,
                "No handler registered, acknowledging unhandled event"
            );
            if let Some(correlation_id) = &event.correlation_id {
                let reply = Reply::failure(
                    correlation_id,
                    ErrorBody::new(
                        error_kind::UNKNOWN_EVENT,
                        format!("no handler for event '{}'", event.name),
                    ),
                );
                self.publish_reply(event, &reply).await;
            }
            self.ack(&queued).await;
            return;
        };

        // Replayed create with a known idempotency token: answer from the
        // store without invoking the handler again.
        if let Some(key) = &event.idempotency_key {
            match self.ctx.store.find_by_idempotency_key(key).await {
                Ok(Some(existing)) => {
                    debug!(
                        service = %self.name,
                        event = %event.name,
                        idempotency_key = %key,
                        "Duplicate event, replying with existing entity"
                    );
                    self.send_reply_success(event, Some(existing)).await;
                    self.ack(&queued).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    self.handle_failure(&queued, HandlerError::from(e)).await;
                    return;
                }
            }
        }

        let started = std::time::Instant::now();
        match handler.handle(&self.ctx, event).await {
            Ok(data) => {
                debug!(
                    service = %self.name,
                    event = %event.name,
                    event_id = %event.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Event processed"
                );
                self.send_reply_success(event, data).await;
                self.ack(&queued).await;
            }
            Err(e) => self.handle_failure(&queued, e).await,
        }
    }

    async fn handle_failure(&self, queued: &QueuedEvent, failure: HandlerError) {
        let event = &queued.event;

        if !failure.is_retryable() {
            warn!(
                service = %self.name,
                event = %event.name,
                event_id = %event.id,
                error = %failure,
                "Permanent failure, dead-lettering"
            );
            self.send_reply_failure(event, &failure).await;
            self.dead_letter(queued, &failure.to_string()).await;
            return;
        }

        let policy = self.policy_for(&failure);
        if policy.exhausted(event.attempt) {
            warn!(
                service = %self.name,
                event = %event.name,
                event_id = %event.id,
                attempt = event.attempt,
                max_attempts = policy.max_attempts,
                error = %failure,
                "Retry budget exhausted, dead-lettering"
            );
            self.send_reply_failure(event, &failure).await;
            self.dead_letter(queued, &failure.to_string()).await;
            return;
        }

        let delay = policy.delay_for(event.attempt);
        debug!(
            service = %self.name,
            event = %event.name,
            event_id = %event.id,
            attempt = event.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Retryable failure, requeueing with backoff"
        );

        match self
            .publisher
            .publish_delayed(&self.config.queue, event.next_attempt(), delay)
            .await
        {
            Ok(()) => self.ack(queued).await,
            Err(e) => {
                // Could not requeue a copy; hand the original back instead.
                error!(
                    service = %self.name,
                    event_id = %event.id,
                    error = %e,
                    "Requeue publish failed, nacking original delivery"
                );
                if let Err(e) = self
                    .consumer
                    .nack(&queued.receipt_handle, Some(delay.as_secs().max(1) as u32))
                    .await
                {
                    error!(service = %self.name, error = %e, "Nack failed");
                }
            }
        }
    }

    fn policy_for(&self, failure: &HandlerError) -> &RetryPolicy {
        match failure {
            HandlerError::ReferenceNotFound { .. } => &self.config.reference_retry,
            _ => &self.config.retry,
        }
    }

    async fn send_reply_success(&self, event: &Event, data: Option<serde_json::Value>) {
        if let Some(correlation_id) = &event.correlation_id {
            let reply = Reply::success(correlation_id, data.unwrap_or(serde_json::Value::Null));
            self.publish_reply(event, &reply).await;
        }
    }

    async fn send_reply_failure(&self, event: &Event, failure: &HandlerError) {
        if let Some(correlation_id) = &event.correlation_id {
            let reply = Reply::failure(correlation_id, failure.to_body());
            self.publish_reply(event, &reply).await;
        }
    }

    async fn publish_reply(&self, event: &Event, reply: &Reply) {
        let Some(reply_to) = event.reply_to.as_deref() else {
            return;
        };
        let Some(reply_evt) = reply_event(event, reply) else {
            return;
        };
        if let Err(e) = self.publisher.publish(reply_to, reply_evt).await {
            warn!(
                service = %self.name,
                reply_to = %reply_to,
                error = %e,
                "Failed to publish reply"
            );
        }
    }

    async fn ack(&self, queued: &QueuedEvent) {
        if let Err(e) = self.consumer.ack(&queued.receipt_handle).await {
            warn!(service = %self.name, error = %e, "Ack failed");
        }
    }

    async fn dead_letter(&self, queued: &QueuedEvent, reason: &str) {
        if let Err(e) = self.consumer.dead_letter(&queued.receipt_handle, reason).await {
            error!(service = %self.name, error = %e, "Dead-letter failed");
        }
    }
}
