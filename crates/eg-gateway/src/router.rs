//! GatewayRouter - external operation to outbound event translation.

use std::sync::Arc;

use eg_broker::{QueuePublisher, ReplyRegistry, RequestError, Requester};
use eg_common::{Event, GatewayConfig};
use eg_routing::{DeliveryMode, RouteEntry, RoutingHandle};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::Result;

/// Result of routing one external request.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// The event was enqueued; no guarantee of downstream success.
    Accepted { event_id: String },
    /// The correlated reply payload from the target service.
    Reply(Value),
}

pub struct GatewayRouter {
    routing: Arc<RoutingHandle>,
    publisher: Arc<dyn QueuePublisher>,
    requester: Requester,
    config: GatewayConfig,
}

impl GatewayRouter {
    pub fn new(
        routing: Arc<RoutingHandle>,
        publisher: Arc<dyn QueuePublisher>,
        registry: Arc<ReplyRegistry>,
        config: GatewayConfig,
    ) -> Self {
        let requester = Requester::new(
            publisher.clone(),
            registry,
            config.reply_queue.clone(),
            config.reply_timeout,
        );
        Self {
            routing,
            publisher,
            requester,
            config,
        }
    }

    /// Translate one external request into exactly one published event.
    ///
    /// Fire-and-forget operations return as soon as the publish succeeds.
    /// Request-reply operations suspend the calling task until the
    /// correlated reply arrives or the configured deadline elapses; on
    /// timeout the publish is not retried, since the original event may
    /// still be processed later.
    pub async fn route(&self, operation: &str, input: Value) -> Result<RouteOutcome> {
        let table = self.routing.current();
        let route = table
            .resolve(operation)
            .ok_or_else(|| GatewayError::UnknownOperation(operation.to_string()))?;

        let invalid = missing_fields(&input, &route.required);
        if !invalid.is_empty() {
            return Err(GatewayError::Validation { fields: invalid });
        }

        let idempotency_key = input
            .get("idempotency_key")
            .and_then(Value::as_str)
            .map(str::to_string);
        let event = Event::new(&route.event, input).with_idempotency_key(idempotency_key);

        match route.mode {
            DeliveryMode::FireAndForget => self.fire_and_forget(route, event).await,
            DeliveryMode::RequestReply => self.request_reply(operation, route, event).await,
        }
    }

    async fn fire_and_forget(&self, route: &RouteEntry, event: Event) -> Result<RouteOutcome> {
        let event_id = event.id.clone();
        self.publisher
            .publish(&route.queue, event)
            .await
            .map_err(|e| GatewayError::Broker(e.to_string()))?;

        debug!(
            operation = %route.operation,
            queue = %route.queue,
            event_id = %event_id,
            "Accepted fire-and-forget operation"
        );
        Ok(RouteOutcome::Accepted { event_id })
    }

    async fn request_reply(
        &self,
        operation: &str,
        route: &RouteEntry,
        event: Event,
    ) -> Result<RouteOutcome> {
        match self.requester.request(&route.queue, event).await {
            Ok(reply) => {
                let data = reply.into_result().unwrap_or(Value::Null);
                Ok(RouteOutcome::Reply(data))
            }
            Err(RequestError::Remote(body)) => Err(GatewayError::Downstream(body)),
            Err(RequestError::Timeout { deadline_ms }) => {
                info!(
                    operation = %operation,
                    queue = %route.queue,
                    deadline_ms = deadline_ms,
                    "Request-reply operation timed out"
                );
                Err(GatewayError::Timeout {
                    operation: operation.to_string(),
                    deadline_ms,
                })
            }
            Err(RequestError::Publish(message)) => Err(GatewayError::Broker(message)),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingHandle> {
        &self.routing
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// Fields from `required` that are absent, null, or empty strings in `input`.
fn missing_fields(input: &Value, required: &[String]) -> Vec<String> {
    if required.is_empty() {
        return Vec::new();
    }
    let Some(body) = input.as_object() else {
        return required.to_vec();
    };
    required
        .iter()
        .filter(|field| {
            match body.get(*field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            }
        })
        .cloned()
        .collect()
}
