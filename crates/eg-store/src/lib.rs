//! Document store contract.
//!
//! Each domain service owns exactly one namespace (collection) and accesses
//! it through [`DocumentStore`]; no connection or transaction is ever shared
//! across services. Documents are JSON objects with an `_id` field; creates
//! may carry an `_idempotency_key` used to suppress duplicate effects of
//! redelivered events.

pub mod memory;

#[cfg(feature = "mongo")]
pub mod mongo;

use async_trait::async_trait;
use serde_json::Value;

pub use memory::InMemoryDocumentStore;

/// Field holding the caller-supplied idempotency token on stored documents.
pub const IDEMPOTENCY_FIELD: &str = "_idempotency_key";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store unavailable or timed out; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("malformed document: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Per-service persistent document storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Namespace (collection) this store is bound to.
    fn namespace(&self) -> &str;

    /// Persist a document, returning its id. A missing `_id` is assigned.
    /// When the document carries an `_idempotency_key` that was already
    /// inserted, the existing id is returned and nothing is written.
    async fn insert(&self, doc: Value) -> Result<String>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Value>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Value>>;
}

pub(crate) fn doc_id(doc: &Value) -> Option<String> {
    doc.get("_id").and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn doc_idempotency_key(doc: &Value) -> Option<String> {
    doc.get(IDEMPOTENCY_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
}
