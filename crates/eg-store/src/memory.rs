//! In-memory document store for tests and the dev monolith.

use dashmap::DashMap;
use serde_json::Value;

use crate::{doc_id, doc_idempotency_key, DocumentStore, Result, StoreError};
use async_trait::async_trait;

pub struct InMemoryDocumentStore {
    namespace: String,
    docs: DashMap<String, Value>,
    by_idempotency_key: DashMap<String, String>,
}

impl InMemoryDocumentStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            docs: DashMap::new(),
            by_idempotency_key: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn insert(&self, mut doc: Value) -> Result<String> {
        if !doc.is_object() {
            return Err(StoreError::Malformed(
                "document must be a JSON object".to_string(),
            ));
        }

        // Duplicate suppression keyed on the idempotency token: concurrent
        // redeliveries of the same create converge on one stored document.
        if let Some(key) = doc_idempotency_key(&doc) {
            if let Some(existing_id) = self.by_idempotency_key.get(&key) {
                return Ok(existing_id.clone());
            }
        }

        let id = match doc_id(&doc) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                doc.as_object_mut()
                    .map(|obj| obj.insert("_id".to_string(), Value::String(id.clone())));
                id
            }
        };

        if let Some(key) = doc_idempotency_key(&doc) {
            self.by_idempotency_key.insert(key, id.clone());
        }
        self.docs.insert(id.clone(), doc);
        Ok(id)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.docs.get(id).map(|d| d.clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Value>> {
        match self.by_idempotency_key.get(key) {
            Some(id) => self.find_by_id(&id).await,
            None => Ok(None),
        }
    }
}
