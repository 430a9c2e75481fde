//! Store service.
//!
//! Stores reference their owning user. The service keeps a local set of
//! known owner ids (ids only, never user state), fed by `user_created`
//! announcements from the User service. Store creation checks that set
//! first and falls back to request-reply verification against the User
//! service for owners it has not seen yet.

use std::sync::Arc;

use async_trait::async_trait;
use eg_common::{Event, ServiceConfig};
use eg_service::{
    EventHandler, HandlerContext, HandlerError, HandlerRegistry, ServiceDeps, ServiceRuntime,
};
use eg_store::DocumentStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::entities::Store;
use crate::{events, queues};
use crate::support::{blank_fields, parse_payload, stamp_idempotency};

#[derive(Debug, Deserialize)]
struct CreateStoreInput {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    id: Option<String>,
    name: String,
    owner_id: String,
    #[serde(default)]
    description: Option<String>,
}

pub struct CreateStoreHandler {
    /// Local index of owner ids announced by the User service.
    owners: Arc<dyn DocumentStore>,
}

impl CreateStoreHandler {
    pub fn new(owners: Arc<dyn DocumentStore>) -> Self {
        Self { owners }
    }

    async fn verify_owner(&self, ctx: &HandlerContext, owner_id: &str) -> Result<(), HandlerError> {
        if self.owners.find_by_id(owner_id).await?.is_some() {
            debug!(owner_id = %owner_id, "Owner known locally");
            return Ok(());
        }

        // Not announced yet; ask the owning service directly.
        let request = Event::new(events::GET_USER, json!({ "id": owner_id }));
        let reply = ctx
            .requester
            .request(queues::USER, request)
            .await
            .map_err(HandlerError::from)?;

        let data = reply.into_result().map_err(|e| {
            HandlerError::TransientStore(format!("user lookup failed: {}", e.message))
        })?;

        if data.get("found").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(HandlerError::reference_not_found("user", owner_id))
        }
    }
}

#[async_trait]
impl EventHandler for CreateStoreHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        let input: CreateStoreInput = parse_payload(event)?;

        let blank = blank_fields(&[("name", &input.name), ("owner_id", &input.owner_id)]);
        if !blank.is_empty() {
            return Err(HandlerError::validation_fields(
                "store requires name and owner_id",
                blank,
            ));
        }

        self.verify_owner(ctx, &input.owner_id).await?;

        let mut store = Store::new(input.name, input.owner_id, input.description);
        if let Some(id) = input.id {
            store.id = id;
        }
        let doc = stamp_idempotency(
            serde_json::to_value(&store).map_err(|e| HandlerError::validation(e.to_string()))?,
            event,
        );
        let id = ctx.store.insert(doc).await?;

        info!(store_id = %id, owner_id = %store.owner_id, "Store created");
        ctx.store.find_by_id(&id).await.map_err(Into::into)
    }
}

#[derive(Debug, Deserialize)]
struct UserCreatedInput {
    user_id: String,
}

/// Records announced users in the local owner index.
pub struct UserCreatedHandler {
    owners: Arc<dyn DocumentStore>,
}

impl UserCreatedHandler {
    pub fn new(owners: Arc<dyn DocumentStore>) -> Self {
        Self { owners }
    }
}

#[async_trait]
impl EventHandler for UserCreatedHandler {
    async fn handle(
        &self,
        _ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        let input: UserCreatedInput = parse_payload(event)?;
        // Keyed by the user id; replays overwrite the same document.
        self.owners
            .insert(json!({ "_id": input.user_id }))
            .await?;
        debug!(user_id = %input.user_id, "Owner recorded");
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct GetInput {
    id: String,
}

pub struct GetStoreHandler;

#[async_trait]
impl EventHandler for GetStoreHandler {
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

/// Wire up the Store service runtime. `owners` is the service's second
/// namespace, holding announced owner ids.
pub fn store_service(
    config: ServiceConfig,
    deps: ServiceDeps,
    owners: Arc<dyn DocumentStore>,
) -> eg_service::Result<Arc<ServiceRuntime>> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        events::CREATE_STORE,
        Arc::new(CreateStoreHandler::new(owners.clone())),
    )?;
    handlers.register(events::USER_CREATED, Arc::new(UserCreatedHandler::new(owners)))?;
    handlers.register(events::GET_STORE, Arc::new(GetStoreHandler))?;
    Ok(ServiceRuntime::new("store", config, deps, handlers))
}
