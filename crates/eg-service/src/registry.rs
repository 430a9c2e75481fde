//! Handler registry - explicit event-name dispatch.
//!
//! Handlers are registered up front and the table is validated then, so a
//! mistyped event name fails at startup instead of at dispatch time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eg_broker::{QueuePublisher, Requester};
use eg_common::Event;
use eg_store::DocumentStore;
use serde_json::Value;

use crate::error::{HandlerError, RegistryError};

/// Collaborators available to every handler invocation.
pub struct HandlerContext {
    /// This service's own document store namespace.
    pub store: Arc<dyn DocumentStore>,
    /// For follow-up events derived from a mutation.
    pub publisher: Arc<dyn QueuePublisher>,
    /// For cross-service reference verification (request-reply).
    pub requester: Arc<Requester>,
}

/// One event handler: a single logical mutation or query against the
/// owning service's store.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process a validated event. `Ok(Some(value))` becomes the reply
    /// payload when the event asked for one.
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> std::result::Result<Option<Value>, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> std::result::Result<(), RegistryError> {
        if event_name.is_empty() {
            return Err(RegistryError::EmptyEventName);
        }
        if self.handlers.contains_key(event_name) {
            return Err(RegistryError::DuplicateHandler(event_name.to_string()));
        }
        self.handlers.insert(event_name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, event_name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_name).cloned()
    }

    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
