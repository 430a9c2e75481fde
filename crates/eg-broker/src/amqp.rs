//! AMQP broker implementation (lapin).
//!
//! Queues are declared durable so events published while a service is down
//! are delivered on its next connect. Dead-lettering republishes to the
//! paired `<queue>.dlq` queue. Delayed redelivery is not supported natively
//! by plain AMQP queues; `publish_delayed` falls back to an immediate
//! publish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use eg_common::{Event, QueuedEvent};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{dead_letter_queue, BrokerError, QueueConsumer, QueuePublisher, Result};

const INBOX_CAPACITY: usize = 64;

/// Open an AMQP connection. Shared by publishers and consumers.
pub async fn connect(url: &str) -> Result<Connection> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    Ok(())
}

async fn publish_persistent(channel: &Channel, queue: &str, body: &[u8]) -> Result<()> {
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    Ok(())
}

pub struct AmqpPublisher {
    channel: Channel,
    identifier: String,
    declared: DashMap<String, ()>,
}

impl AmqpPublisher {
    pub async fn new(connection: &Connection, identifier: impl Into<String>) -> Result<Self> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            channel,
            identifier: identifier.into(),
            declared: DashMap::new(),
        })
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        if self.declared.contains_key(queue) {
            return Ok(());
        }
        declare_durable(&self.channel, queue).await?;
        self.declared.insert(queue.to_string(), ());
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn publish(&self, queue: &str, event: Event) -> Result<()> {
        self.ensure_queue(queue).await?;
        let body = serde_json::to_vec(&event)?;
        debug!(queue = %queue, event = %event.name, event_id = %event.id, "Publishing event");
        publish_persistent(&self.channel, queue, &body).await
    }
}

pub struct AmqpConsumer {
    channel: Channel,
    queue_name: String,
    inbox: Mutex<mpsc::Receiver<Delivery>>,
    in_flight: DashMap<String, Delivery>,
    running: Arc<AtomicBool>,
}

impl AmqpConsumer {
    /// Bind to `queue`, declaring it (and its dead-letter queue) durable.
    pub async fn bind(connection: &Connection, queue: &str, prefetch: u16) -> Result<Arc<Self>> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        declare_durable(&channel, queue).await?;
        declare_durable(&channel, &dead_letter_queue(queue)).await?;

        let mut deliveries = channel
            .basic_consume(
                queue,
                &format!("eventgate-{}", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        {
            let queue = queue.to_string();
            let running = running.clone();
            tokio::spawn(async move {
                while let Some(delivery) = deliveries.next().await {
                    match delivery {
                        Ok(d) => {
                            if tx.send(d).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(queue = %queue, error = %e, "AMQP delivery error");
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
                info!(queue = %queue, "AMQP delivery stream closed");
            });
        }

        Ok(Arc::new(Self {
            channel,
            queue_name: queue.to_string(),
            inbox: Mutex::new(rx),
            in_flight: DashMap::new(),
            running,
        }))
    }

    fn take_in_flight(&self, receipt_handle: &str) -> Result<Delivery> {
        self.in_flight
            .remove(receipt_handle)
            .map(|(_, d)| d)
            .ok_or_else(|| BrokerError::UnknownReceipt(receipt_handle.to_string()))
    }
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max: usize) -> Result<Vec<QueuedEvent>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let mut inbox = self.inbox.lock().await;
        let mut batch = Vec::new();
        while batch.len() < max {
            let Ok(delivery) = inbox.try_recv() else { break };
            match serde_json::from_slice::<Event>(&delivery.data) {
                Ok(event) => {
                    let receipt_handle = delivery.delivery_tag.to_string();
                    self.in_flight.insert(receipt_handle.clone(), delivery);
                    batch.push(QueuedEvent {
                        event,
                        receipt_handle,
                        queue_name: self.queue_name.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue_name,
                        error = %e,
                        "Dropping malformed event payload"
                    );
                    let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                }
            }
        }
        Ok(batch)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let delivery = self.take_in_flight(receipt_handle)?;
        delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        if delay_seconds.is_some() {
            debug!(queue = %self.queue_name, "Redelivery delay not supported, requeueing now");
        }
        let delivery = self.take_in_flight(receipt_handle)?;
        delivery
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> Result<()> {
        let delivery = self.take_in_flight(receipt_handle)?;
        debug!(
            queue = %self.queue_name,
            reason = %reason,
            "Dead-lettering event"
        );
        publish_persistent(
            &self.channel,
            &dead_letter_queue(&self.queue_name),
            &delivery.data,
        )
        .await?;
        delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.channel.status().connected()
    }
}
