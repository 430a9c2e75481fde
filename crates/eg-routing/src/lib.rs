//! Service registry / routing table.
//!
//! Maps each external operation to the queue and event name it is delivered
//! as, plus its delivery mode and minimal required-field contract. Loaded
//! once at gateway startup from a TOML file; read-only at runtime, with
//! whole-table atomic replacement for hot reload.
//!
//! ```toml
//! [[route]]
//! operation = "create_organization"
//! queue = "organization"
//! event = "create_organization"
//! mode = "request_reply"
//! required = ["name"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Publish and return an acknowledgement immediately; "enqueued", not
    /// "applied".
    #[default]
    FireAndForget,
    /// Publish with a correlation id and await the reply.
    RequestReply,
}

/// One external operation and its delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub operation: String,
    pub queue: String,
    pub event: String,
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Fields that must be present and non-empty in the request body.
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("failed to read routing file {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse routing file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate operation in routing table: {0}")]
    DuplicateOperation(String),

    #[error("route for '{operation}' has an empty {field}")]
    EmptyField {
        operation: String,
        field: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, RoutingError>;

#[derive(Debug, Deserialize)]
struct RoutingFile {
    #[serde(default, rename = "route")]
    routes: Vec<RouteEntry>,
}

/// Immutable operation → route mapping.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, RouteEntry>,
}

impl RoutingTable {
    /// Build a validated table. Duplicate operations and empty names are
    /// rejected at load time, not discovered at dispatch time.
    pub fn from_entries(entries: Vec<RouteEntry>) -> Result<Self> {
        let mut routes = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.operation.is_empty() {
                return Err(RoutingError::EmptyField {
                    operation: "<unnamed>".to_string(),
                    field: "operation",
                });
            }
            if entry.queue.is_empty() {
                return Err(RoutingError::EmptyField {
                    operation: entry.operation,
                    field: "queue",
                });
            }
            if entry.event.is_empty() {
                return Err(RoutingError::EmptyField {
                    operation: entry.operation,
                    field: "event",
                });
            }
            if routes.contains_key(&entry.operation) {
                return Err(RoutingError::DuplicateOperation(entry.operation));
            }
            routes.insert(entry.operation.clone(), entry);
        }
        Ok(Self { routes })
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: RoutingFile = toml::from_str(raw)?;
        Self::from_entries(file.routes)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| RoutingError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&raw)
    }

    pub fn resolve(&self, operation: &str) -> Option<&RouteEntry> {
        self.routes.get(operation)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn operations(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }
}

/// Shared handle to the current routing table.
///
/// Readers take a cheap `Arc` snapshot; `replace` swaps the whole table
/// atomically so a reload never exposes a partially-applied mapping.
pub struct RoutingHandle {
    inner: RwLock<Arc<RoutingTable>>,
}

impl RoutingHandle {
    pub fn new(table: RoutingTable) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Arc::new(table)),
        })
    }

    pub fn current(&self) -> Arc<RoutingTable> {
        self.inner.read().clone()
    }

    pub fn replace(&self, table: RoutingTable) {
        let routes = table.len();
        *self.inner.write() = Arc::new(table);
        info!(routes = routes, "Routing table replaced");
    }

    /// Reload from a TOML file. The current table stays in place when the
    /// new one fails validation.
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let table = RoutingTable::load(path)?;
        let routes = table.len();
        self.replace(table);
        Ok(routes)
    }
}
