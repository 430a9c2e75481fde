//! Shared handler plumbing.

use eg_common::Event;
use eg_service::HandlerError;
use eg_store::IDEMPOTENCY_FIELD;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Decode an event payload into the handler's input shape. A payload that
/// does not match is a permanent validation failure, never a retry.
pub(crate) fn parse_payload<T: DeserializeOwned>(event: &Event) -> Result<T, HandlerError> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| HandlerError::validation(format!("malformed {} payload: {}", event.name, e)))
}

/// Carry the caller's idempotency token onto the stored document so
/// redeliveries can be matched against it.
pub(crate) fn stamp_idempotency(mut doc: Value, event: &Event) -> Value {
    if let (Some(obj), Some(key)) = (doc.as_object_mut(), &event.idempotency_key) {
        obj.insert(IDEMPOTENCY_FIELD.to_string(), json!(key));
    }
    doc
}

/// Collect required string fields that are missing or blank.
pub(crate) fn blank_fields(pairs: &[(&str, &str)]) -> Vec<String> {
    pairs
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name.to_string())
        .collect()
}
