//! MongoDB document store.

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::{Collection, Database};
use serde_json::Value;
use tracing::debug;

use crate::{doc_id, doc_idempotency_key, DocumentStore, Result, StoreError, IDEMPOTENCY_FIELD};

pub struct MongoDocumentStore {
    namespace: String,
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    pub fn new(db: &Database, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            collection: db.collection(&namespace),
            namespace,
        }
    }

    fn to_document(value: &Value) -> Result<Document> {
        mongodb::bson::to_document(value).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    fn to_value(document: Document) -> Result<Value> {
        mongodb::bson::from_document(document).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn insert(&self, mut doc: Value) -> Result<String> {
        if !doc.is_object() {
            return Err(StoreError::Malformed(
                "document must be a JSON object".to_string(),
            ));
        }

        if let Some(key) = doc_idempotency_key(&doc) {
            if let Some(existing) = self.find_by_idempotency_key(&key).await? {
                let id = doc_id(&existing).unwrap_or_default();
                debug!(
                    namespace = %self.namespace,
                    idempotency_key = %key,
                    "Duplicate insert suppressed"
                );
                return Ok(id);
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

        let document = Self::to_document(&doc)?;
        self.collection
            .insert_one(document)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(id)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Value>> {
        let found = self
            .collection
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        found.map(Self::to_value).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Value>> {
        let found = self
            .collection
            .find_one(doc! { IDEMPOTENCY_FIELD: key })
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        found.map(Self::to_value).transpose()
    }
}
