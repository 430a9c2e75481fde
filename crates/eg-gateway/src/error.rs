//! Gateway Error Types

use eg_common::{error_kind, ErrorBody};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("validation failed: missing or invalid fields: {}", fields.join(", "))]
    Validation { fields: Vec<String> },

    #[error("no reply for operation '{operation}' within {deadline_ms}ms")]
    Timeout { operation: String, deadline_ms: u64 },

    /// A downstream service replied with a structured failure.
    #[error("downstream error: {}", .0.message)]
    Downstream(ErrorBody),

    #[error("broker publish failed: {0}")]
    Broker(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOperation(_) => error_kind::UNKNOWN_OPERATION,
            Self::Validation { .. } => error_kind::VALIDATION,
            Self::Timeout { .. } => error_kind::GATEWAY_TIMEOUT,
            Self::Downstream(_) => error_kind::INTERNAL,
            Self::Broker(_) => error_kind::BROKER,
        }
    }

    /// Structured error body surfaced to the external caller.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Downstream(body) => body.clone(),
            Self::Validation { fields } => ErrorBody::new(self.kind(), self.to_string())
                .with_details(json!({ "fields": fields })),
            Self::Timeout {
                operation,
                deadline_ms,
            } => ErrorBody::new(self.kind(), self.to_string()).with_details(json!({
                "operation": operation,
                "deadline_ms": deadline_ms,
            })),
            _ => ErrorBody::new(self.kind(), self.to_string()),
        }
    }
}
