//! Organization service.
//!
//! Root of the ownership chain: organizations reference nothing, so
//! creation needs no cross-service verification.

use std::sync::Arc;

use async_trait::async_trait;
use eg_common::{Event, ServiceConfig};
use eg_service::{
    EventHandler, HandlerContext, HandlerError, HandlerRegistry, ServiceDeps, ServiceRuntime,
};
use eg_store::DocumentStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::entities::Organization;
use crate::events;
use crate::support::{blank_fields, parse_payload, stamp_idempotency};

#[derive(Debug, Deserialize)]
struct CreateOrganizationInput {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

pub struct CreateOrganizationHandler;

#[async_trait]
impl EventHandler for CreateOrganizationHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        let input: CreateOrganizationInput = parse_payload(event)?;

        let blank = blank_fields(&[("name", &input.name)]);
        if !blank.is_empty() {
            return Err(HandlerError::validation_fields(
                "organization requires a non-empty name",
                blank,
            ));
        }

        let mut organization = Organization::new(input.name, input.description);
        if let Some(id) = input.id {
            organization.id = id;
        }
        let doc = stamp_idempotency(
            serde_json::to_value(&organization)
                .map_err(|e| HandlerError::validation(e.to_string()))?,
            event,
        );
        let id = ctx.store.insert(doc).await?;

        info!(organization_id = %id, name = %organization.name, "Organization created");
        ctx.store.find_by_id(&id).await.map_err(Into::into)
    }
}

#[derive(Debug, Deserialize)]
struct GetInput {
    id: String,
}

/// Answers `get_organization` reference lookups from other services.
pub struct GetOrganizationHandler;

#[async_trait]
impl EventHandler for GetOrganizationHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        let input: GetInput = parse_payload(event)?;
        match ctx.store.find_by_id(&input.id).await? {
            Some(entity) => Ok(Some(json!({ "found": true, "entity": entity }))),
            None => Ok(Some(json!({ "found": false }))),
        }
    }
}

/// Wire up the Organization service runtime.
pub fn organization_service(
    config: ServiceConfig,
    deps: ServiceDeps,
) -> eg_service::Result<Arc<ServiceRuntime>> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(events::CREATE_ORGANIZATION, Arc::new(CreateOrganizationHandler))?;
    handlers.register(events::GET_ORGANIZATION, Arc::new(GetOrganizationHandler))?;
    Ok(ServiceRuntime::new("organization", config, deps, handlers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eg_broker::{InMemoryBroker, ReplyRegistry, Requester};
    use eg_store::{DocumentStore, InMemoryDocumentStore};
    use std::time::Duration;

    fn test_ctx(store: Arc<InMemoryDocumentStore>) -> HandlerContext {
        let broker = InMemoryBroker::new();
        let publisher = broker.publisher();
        HandlerContext {
            store,
            publisher: publisher.clone(),
            requester: Arc::new(Requester::new(
                publisher,
                ReplyRegistry::new(),
                "organization.replies",
                Duration::from_millis(100),
            )),
        }
    }

    #[tokio::test]
    async fn create_persists_and_get_finds_it() {
        let store = Arc::new(InMemoryDocumentStore::new("organizations"));
        let ctx = test_ctx(store.clone());

        let created = CreateOrganizationHandler
            .handle(&ctx, &Event::new("create_organization", json!({"name": "Acme"})))
            .await
            .unwrap()
            .unwrap();
        let id = created["_id"].as_str().unwrap().to_string();
        assert_eq!(store.len(), 1);

        let found = GetOrganizationHandler
            .handle(&ctx, &Event::new("get_organization", json!({"id": id})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["found"], true);
        assert_eq!(found["entity"]["name"], "Acme");
    }

    #[tokio::test]
    async fn blank_name_is_a_validation_failure() {
        let ctx = test_ctx(Arc::new(InMemoryDocumentStore::new("organizations")));
        let err = CreateOrganizationHandler
            .handle(&ctx, &Event::new("create_organization", json!({"name": "  "})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Validation { .. }));
    }

    #[tokio::test]
    async fn get_for_missing_id_reports_not_found() {
        let ctx = test_ctx(Arc::new(InMemoryDocumentStore::new("organizations")));
        let reply = GetOrganizationHandler
            .handle(&ctx, &Event::new("get_organization", json!({"id": "o9"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply["found"], false);
    }
}
