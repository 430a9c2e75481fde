//! Correlated request-reply plumbing over queues.
//!
//! A [`ReplyRegistry`] holds one oneshot waiter per correlation id, a
//! [`ReplyPump`] drains a reply queue and resolves waiters, and a
//! [`Requester`] ties both to a publisher for synchronous-style calls.
//! Waiters that time out are deregistered, so a late reply is discarded
//! without a dangling resume.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use eg_common::{ErrorBody, Event, QueuedEvent, Reply};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, warn};

use crate::{QueueConsumer, QueuePublisher};

const PUMP_IDLE_BACKOFF: Duration = Duration::from_millis(25);
const PUMP_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const PUMP_BATCH: usize = 16;

/// Pending request-reply waiters keyed by correlation id.
#[derive(Default)]
pub struct ReplyRegistry {
    pending: DashMap<String, oneshot::Sender<Reply>>,
}

impl ReplyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter. The returned receiver resolves when a reply with
    /// this correlation id arrives.
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.to_string(), tx);
        rx
    }

    /// Deliver a reply to its waiter. Returns false when no waiter is
    /// registered (late reply after timeout, or unknown correlation id).
    pub fn resolve(&self, reply: Reply) -> bool {
        match self.pending.remove(&reply.correlation_id) {
            Some((correlation_id, tx)) => {
                if tx.send(reply).is_err() {
                    debug!(correlation_id = %correlation_id, "Reply waiter already dropped");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Drop a waiter registration (on timeout or failed publish).
    pub fn forget(&self, correlation_id: &str) {
        self.pending.remove(correlation_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Background loop that drains a reply queue into a [`ReplyRegistry`].
pub struct ReplyPump;

impl ReplyPump {
    pub fn spawn(
        consumer: Arc<dyn QueueConsumer>,
        registry: Arc<ReplyRegistry>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(queue = %consumer.identifier(), "Reply pump shutting down");
                        break;
                    }
                    result = consumer.poll(PUMP_BATCH) => {
                        match result {
                            Ok(batch) if !batch.is_empty() => {
                                for queued in batch {
                                    Self::handle(&*consumer, &registry, queued).await;
                                }
                            }
                            Ok(_) => {
                                tokio::time::sleep(PUMP_IDLE_BACKOFF).await;
                            }
                            Err(e) => {
                                error!(
                                    queue = %consumer.identifier(),
                                    error = %e,
                                    "Error polling reply queue"
                                );
                                tokio::time::sleep(PUMP_ERROR_BACKOFF).await;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn handle(
        consumer: &dyn QueueConsumer,
        registry: &ReplyRegistry,
        queued: QueuedEvent,
    ) {
        match serde_json::from_value::<Reply>(queued.event.payload.clone()) {
            Ok(reply) => {
                let correlation_id = reply.correlation_id.clone();
                if !registry.resolve(reply) {
                    debug!(
                        correlation_id = %correlation_id,
                        "Discarding reply with no registered waiter"
                    );
                }
            }
            Err(e) => {
                warn!(
                    event = %queued.event.name,
                    event_id = %queued.event.id,
                    error = %e,
                    "Malformed reply payload, dropping"
                );
            }
        }
        // Replies are never redelivered: a waiter is either resolved now or
        // already gone.
        if let Err(e) = consumer.ack(&queued.receipt_handle).await {
            warn!(error = %e, "Failed to ack reply");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("no reply within {deadline_ms}ms")]
    Timeout { deadline_ms: u64 },

    #[error("remote error: {}", .0.message)]
    Remote(ErrorBody),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Synchronous-style request-reply over queues.
///
/// Publishes the request with a fresh correlation id and this requester's
/// reply queue, then suspends the calling task until the correlated reply
/// arrives or the deadline elapses. Only the calling task waits; other
/// requests proceed independently.
pub struct Requester {
    publisher: Arc<dyn QueuePublisher>,
    registry: Arc<ReplyRegistry>,
    reply_queue: String,
    timeout: Duration,
}

impl Requester {
    pub fn new(
        publisher: Arc<dyn QueuePublisher>,
        registry: Arc<ReplyRegistry>,
        reply_queue: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            registry,
            reply_queue: reply_queue.into(),
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ReplyRegistry> {
        &self.registry
    }

    /// Send `event` to `queue` and await the correlated reply.
    ///
    /// A timed-out registration is released before returning, so a reply
    /// arriving after the deadline is dropped by the pump.
    pub async fn request(&self, queue: &str, mut event: Event) -> Result<Reply, RequestError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        event.correlation_id = Some(correlation_id.clone());
        event.reply_to = Some(self.reply_queue.clone());

        let rx = self.registry.register(&correlation_id);

        if let Err(e) = self.publisher.publish(queue, event).await {
            self.registry.forget(&correlation_id);
            return Err(RequestError::Publish(e.to_string()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => {
                if reply.ok {
                    Ok(reply)
                } else {
                    Err(RequestError::Remote(reply.into_result().unwrap_err()))
                }
            }
            Ok(Err(_)) | Err(_) => {
                self.registry.forget(&correlation_id);
                Err(RequestError::Timeout {
                    deadline_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}
