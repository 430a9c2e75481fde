use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ============================================================================
// Core Event Types
// ============================================================================

/// The event structure that flows through the system.
///
/// Events are the only mechanism by which entities are created, mutated or
/// linked. The `name` tags the intent (`create_organization`, `get_user`,
/// ...), the `payload` carries the structured body, and the optional
/// correlation fields support request-reply delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Queue name the reply should be published to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Caller-supplied token used to suppress duplicate effects of
    /// redelivered messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Delivery attempt counter, starting at 1. Bumped when the event is
    /// requeued after a retryable failure.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            correlation_id: None,
            reply_to: None,
            idempotency_key: None,
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_correlation(mut self, correlation_id: String, reply_to: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self.reply_to = Some(reply_to);
        self
    }

    /// Copy of this event for the next delivery attempt. Keeps the same
    /// event id so downstream deduplication still applies.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt + 1;
        next
    }
}

/// Build the reply event for a request event.
///
/// Reply events are named `<request>.reply` and carry the serialized [`Reply`]
/// as their payload. Returns `None` when the request did not ask for a reply.
pub fn reply_event(request: &Event, reply: &Reply) -> Option<Event> {
    request.reply_to.as_ref()?;
    let payload = serde_json::to_value(reply).unwrap_or_else(|_| Value::Null);
    let mut event = Event::new(format!("{}.reply", request.name), payload);
    event.correlation_id = request.correlation_id.clone();
    Some(event)
}

/// An event received from a queue with delivery tracking metadata.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: Event,
    pub receipt_handle: String,
    pub queue_name: String,
}

// ============================================================================
// Replies
// ============================================================================

/// Correlated reply to a request-reply event.
///
/// Carries either the reply payload or a structured error body so that
/// downstream failures are visible to the original caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(correlation_id: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorBody> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| ErrorBody {
                kind: error_kind::INTERNAL.to_string(),
                message: "reply carried no error body".to_string(),
                details: None,
            }))
        }
    }
}

/// Structured error surfaced to external callers and embedded in replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Wire-level error kind tags.
pub mod error_kind {
    pub const VALIDATION: &str = "VALIDATION";
    pub const UNKNOWN_OPERATION: &str = "UNKNOWN_OPERATION";
    pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
    pub const TRANSIENT_STORE: &str = "TRANSIENT_STORE";
    pub const REFERENCE_NOT_FOUND: &str = "REFERENCE_NOT_FOUND";
    pub const GATEWAY_TIMEOUT: &str = "GATEWAY_TIMEOUT";
    pub const BROKER: &str = "BROKER";
    pub const INTERNAL: &str = "INTERNAL";
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Retry schedule for requeued events: exponential backoff with jitter,
/// capped at `max_delay_ms`, up to `max_attempts` total deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Whether the given delivery attempt was the last one allowed.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Backoff delay before the next delivery after `attempt` failed.
    /// Doubles per attempt, capped, with up to 20% additive jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.max_delay_ms);
        let jitter = if capped > 0 {
            rand::thread_rng().gen_range(0..=capped / 5)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Configuration for one domain service runtime instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Durable queue this service consumes.
    pub queue: String,
    /// Queue this service receives correlated replies on.
    pub reply_queue: String,
    /// Bounded worker slots for concurrent in-flight handler invocations.
    pub workers: usize,
    /// Policy for transient failures (store unavailable, request timeout).
    pub retry: RetryPolicy,
    /// Separate budget for unresolved references, covering ordering races.
    pub reference_retry: RetryPolicy,
    /// Deadline for cross-service request-reply verification calls.
    pub request_timeout: Duration,
}

impl ServiceConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            reply_queue: format!("{}.replies", queue),
            queue,
            workers: 4,
            retry: RetryPolicy::default(),
            reference_retry: RetryPolicy::new(5, 1_000, 10_000),
            request_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reference_retry(mut self, retry: RetryPolicy) -> Self {
        self.reference_retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Configuration for the gateway router.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Queue the gateway receives correlated replies on.
    pub reply_queue: String,
    /// Deadline for request-reply operations before surfacing a timeout.
    pub reply_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reply_queue: "gateway.replies".to_string(),
            reply_timeout: Duration::from_secs(10),
        }
    }
}
