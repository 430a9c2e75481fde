//! Service Error Types

use eg_common::{error_kind, ErrorBody};
use eg_broker::RequestError;
use eg_store::StoreError;
use serde_json::json;
use thiserror::Error;

/// Typed failure returned by an event handler.
///
/// The runtime classifies each variant into its delivery policy: validation
/// failures dead-letter immediately, transient failures requeue with
/// backoff, unresolved references get a separate bounded retry budget.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("validation error: {message}")]
    Validation {
        message: String,
        fields: Vec<String>,
    },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("referenced {kind} not found: {id}")]
    ReferenceNotFound { kind: String, id: String },
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn validation_fields(message: impl Into<String>, fields: Vec<String>) -> Self {
        Self::Validation {
            message: message.into(),
            fields,
        }
    }

    pub fn reference_not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ReferenceNotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Whether this failure may succeed on a later delivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => error_kind::VALIDATION,
            Self::TransientStore(_) => error_kind::TRANSIENT_STORE,
            Self::ReferenceNotFound { .. } => error_kind::REFERENCE_NOT_FOUND,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Validation { fields, .. } if !fields.is_empty() => {
                ErrorBody::new(self.kind(), self.to_string())
                    .with_details(json!({ "fields": fields }))
            }
            Self::ReferenceNotFound { kind, id } => ErrorBody::new(self.kind(), self.to_string())
                .with_details(json!({ "kind": kind, "id": id })),
            _ => ErrorBody::new(self.kind(), self.to_string()),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(message) => Self::TransientStore(message),
            StoreError::Malformed(message) => Self::Validation {
                message,
                fields: Vec::new(),
            },
        }
    }
}

impl From<RequestError> for HandlerError {
    fn from(e: RequestError) -> Self {
        match e {
            // No reply in time: the owning service may just be behind.
            RequestError::Timeout { deadline_ms } => {
                Self::TransientStore(format!("verification reply not received in {deadline_ms}ms"))
            }
            RequestError::Publish(message) => Self::TransientStore(message),
            RequestError::Remote(body) => {
                if body.kind == error_kind::REFERENCE_NOT_FOUND {
                    let details = body.details.unwrap_or_default();
                    Self::ReferenceNotFound {
                        kind: details
                            .get("kind")
                            .and_then(|v| v.as_str())
                            .unwrap_or("entity")
                            .to_string(),
                        id: details
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }
                } else {
                    Self::TransientStore(body.message)
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler registered with an empty event name")]
    EmptyEventName,

    #[error("duplicate handler for event: {0}")]
    DuplicateHandler(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("handler registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("broker error: {0}")]
    Broker(#[from] eg_broker::BrokerError),
}
