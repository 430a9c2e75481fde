//! In-process broker with durable-queue semantics.
//!
//! Queues live in the broker, not in the consumer: events published while no
//! consumer is attached stay queued and are delivered on the next poll after
//! a consumer (re)binds. Used by tests and the dev monolith.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use eg_common::{Event, QueuedEvent};
use parking_lot::Mutex;
use tracing::debug;

use crate::{dead_letter_queue, BrokerError, QueueConsumer, QueuePublisher, Result};

#[derive(Default)]
struct QueueState {
    ready: Mutex<VecDeque<Event>>,
    delayed: Mutex<Vec<(Instant, Event)>>,
    in_flight: Mutex<HashMap<String, Event>>,
}

impl QueueState {
    /// Move events whose delay elapsed onto the ready queue.
    fn promote_due(&self) {
        let now = Instant::now();
        let mut delayed = self.delayed.lock();
        if delayed.is_empty() {
            return;
        }
        let mut ready = self.ready.lock();
        let mut remaining = Vec::with_capacity(delayed.len());
        for (due_at, event) in delayed.drain(..) {
            if due_at <= now {
                ready.push_back(event);
            } else {
                remaining.push((due_at, event));
            }
        }
        *delayed = remaining;
    }

    fn depth(&self) -> usize {
        self.ready.lock().len() + self.delayed.lock().len()
    }
}

/// Shared in-process broker. Clone handles via `Arc`.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::default()))
            .clone()
    }

    /// Declare a queue up front. Idempotent; queues are also auto-declared
    /// on first publish or consume.
    pub fn declare_queue(&self, name: &str) {
        self.queue(name);
    }

    /// Deliverable + delayed events waiting on `name` (excludes in-flight).
    pub fn queue_depth(&self, name: &str) -> usize {
        self.queues.get(name).map(|q| q.depth()).unwrap_or(0)
    }

    /// Depth of the dead-letter queue paired with `name`.
    pub fn dlq_depth(&self, name: &str) -> usize {
        self.queue_depth(&dead_letter_queue(name))
    }

    /// Snapshot of the events currently on `name`, oldest first.
    pub fn peek_queue(&self, name: &str) -> Vec<Event> {
        match self.queues.get(name) {
            Some(q) => {
                q.promote_due();
                q.ready.lock().iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn publisher(self: &Arc<Self>) -> Arc<InMemoryPublisher> {
        Arc::new(InMemoryPublisher {
            broker: self.clone(),
        })
    }

    pub fn consumer(self: &Arc<Self>, queue: &str) -> Arc<InMemoryConsumer> {
        self.declare_queue(queue);
        Arc::new(InMemoryConsumer {
            broker: self.clone(),
            queue_name: queue.to_string(),
            running: AtomicBool::new(true),
        })
    }

    fn enqueue(&self, queue: &str, event: Event, delay: Option<Duration>) {
        let state = self.queue(queue);
        match delay {
            Some(d) if !d.is_zero() => state.delayed.lock().push((Instant::now() + d, event)),
            _ => state.ready.lock().push_back(event),
        }
    }
}

pub struct InMemoryPublisher {
    broker: Arc<InMemoryBroker>,
}

#[async_trait]
impl QueuePublisher for InMemoryPublisher {
    fn identifier(&self) -> &str {
        "memory"
    }

    async fn publish(&self, queue: &str, event: Event) -> Result<()> {
        debug!(queue = %queue, event = %event.name, event_id = %event.id, "Publishing event");
        self.broker.enqueue(queue, event, None);
        Ok(())
    }

    async fn publish_delayed(&self, queue: &str, event: Event, delay: Duration) -> Result<()> {
        debug!(
            queue = %queue,
            event = %event.name,
            event_id = %event.id,
            delay_ms = delay.as_millis() as u64,
            "Publishing delayed event"
        );
        self.broker.enqueue(queue, event, Some(delay));
        Ok(())
    }
}

pub struct InMemoryConsumer {
    broker: Arc<InMemoryBroker>,
    queue_name: String,
    running: AtomicBool,
}

impl InMemoryConsumer {
    fn state(&self) -> Arc<QueueState> {
        self.broker.queue(&self.queue_name)
    }

    fn take_in_flight(&self, receipt_handle: &str) -> Result<Event> {
        self.state()
            .in_flight
            .lock()
            .remove(receipt_handle)
            .ok_or_else(|| BrokerError::UnknownReceipt(receipt_handle.to_string()))
    }
}

#[async_trait]
impl QueueConsumer for InMemoryConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max: usize) -> Result<Vec<QueuedEvent>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let state = self.state();
        state.promote_due();

        let mut batch = Vec::new();
        {
            let mut ready = state.ready.lock();
            let mut in_flight = state.in_flight.lock();
            while batch.len() < max {
                let Some(event) = ready.pop_front() else { break };
                let receipt_handle = uuid::Uuid::new_v4().to_string();
                in_flight.insert(receipt_handle.clone(), event.clone());
                batch.push(QueuedEvent {
                    event,
                    receipt_handle,
                    queue_name: self.queue_name.clone(),
                });
            }
        }
        Ok(batch)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.take_in_flight(receipt_handle)?;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let event = self.take_in_flight(receipt_handle)?;
        let delay = delay_seconds.map(|s| Duration::from_secs(s as u64));
        self.broker.enqueue(&self.queue_name, event, delay);
        Ok(())
    }

    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> Result<()> {
        let event = self.take_in_flight(receipt_handle)?;
        debug!(
            queue = %self.queue_name,
            event = %event.name,
            event_id = %event.id,
            reason = %reason,
            "Dead-lettering event"
        );
        self.broker
            .enqueue(&dead_letter_queue(&self.queue_name), event, None);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
