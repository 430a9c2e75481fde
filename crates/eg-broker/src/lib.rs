//! Broker contract and implementations.
//!
//! The rest of the system only sees two seams:
//! - [`QueuePublisher`]: publish events to a named durable queue
//! - [`QueueConsumer`]: poll one queue, then ack / nack / dead-letter
//!
//! `memory` provides the in-process broker used by tests and the dev
//! monolith. The `amqp` feature adds a lapin-backed implementation with the
//! same semantics over real durable queues.

pub mod memory;
pub mod reply;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use eg_common::{Event, QueuedEvent};
use std::time::Duration;

pub use memory::{InMemoryBroker, InMemoryConsumer, InMemoryPublisher};
pub use reply::{ReplyPump, ReplyRegistry, RequestError, Requester};

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Publishes events to named durable queues.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, queue: &str, event: Event) -> Result<()>;

    /// Publish an event that becomes deliverable only after `delay`.
    /// Brokers without native delay support deliver immediately.
    async fn publish_delayed(&self, queue: &str, event: Event, delay: Duration) -> Result<()> {
        let _ = delay;
        self.publish(queue, event).await
    }
}

/// Consumes one named durable queue.
///
/// Delivery is at-least-once: an event stays on the queue (invisible while
/// in flight) until it is acked, nacked back, or dead-lettered.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Receive up to `max` events. Returns an empty vec when the queue has
    /// nothing deliverable; never blocks waiting for messages.
    async fn poll(&self, max: usize) -> Result<Vec<QueuedEvent>>;

    /// Remove the event from the queue.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return the event to the queue for redelivery.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Move the event to the paired dead-letter queue for manual inspection.
    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> Result<()>;

    async fn stop(&self);

    fn is_healthy(&self) -> bool;
}
