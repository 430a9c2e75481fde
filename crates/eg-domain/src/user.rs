//! User service.
//!
//! Users reference their organization. The reference is verified against
//! the Organization service via request-reply before the user is
//! persisted; a verification timeout is a transient failure (requeue), an
//! explicit "not found" goes through the bounded reference-retry budget to
//! absorb ordering races with `create_organization`.
//!
//! Every created user is announced to the Store service with a
//! `user_created` follow-up event.

use std::sync::Arc;

use async_trait::async_trait;
use eg_broker::QueuePublisher;
use eg_common::{Event, ServiceConfig};
use eg_service::{
    EventHandler, HandlerContext, HandlerError, HandlerRegistry, ServiceDeps, ServiceRuntime,
};
use eg_store::DocumentStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::entities::User;
use crate::{events, queues};
use crate::support::{blank_fields, parse_payload, stamp_idempotency};

#[derive(Debug, Deserialize)]
struct CreateUserInput {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    id: Option<String>,
    email: String,
    name: String,
    organization_id: String,
}

pub struct CreateUserHandler;

impl CreateUserHandler {
    async fn verify_organization(
        ctx: &HandlerContext,
        organization_id: &str,
    ) -> Result<(), HandlerError> {
        let request = Event::new(events::GET_ORGANIZATION, json!({ "id": organization_id }));
        let reply = ctx
            .requester
            .request(queues::ORGANIZATION, request)
            .await
            .map_err(HandlerError::from)?;

        let data = reply.into_result().map_err(|e| {
            HandlerError::TransientStore(format!("organization lookup failed: {}", e.message))
        })?;

        if data.get("found").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(HandlerError::reference_not_found(
                "organization",
                organization_id,
            ))
        }
    }
}

#[async_trait]
impl EventHandler for CreateUserHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
    ) -> Result<Option<Value>, HandlerError> {
        let input: CreateUserInput = parse_payload(event)?;

        let mut blank = blank_fields(&[
            ("email", &input.email),
            ("name", &input.name),
            ("organization_id", &input.organization_id),
        ]);
        if !input.email.trim().is_empty() && !input.email.contains('@') {
            blank.push("email".to_string());
        }
        if !blank.is_empty() {
            return Err(HandlerError::validation_fields(
                "user requires email, name and organization_id",
                blank,
            ));
        }

        Self::verify_organization(ctx, &input.organization_id).await?;

        let mut user = User::new(input.email, input.name, input.organization_id);
        if let Some(id) = input.id {
            user.id = id;
        }
        let doc = stamp_idempotency(
            serde_json::to_value(&user).map_err(|e| HandlerError::validation(e.to_string()))?,
            event,
        );
        let id = ctx.store.insert(doc).await?;

        info!(
            user_id = %id,
            organization_id = %user.organization_id,
            "User created"
        );

        // Announce the new owner to the Store service. Failure here never
        // unwinds the persisted user; the Store service falls back to
        // request-reply verification for owners it has not seen.
        let announcement = Event::new(events::USER_CREATED, json!({ "user_id": id }));
        if let Err(e) = ctx.publisher.publish(queues::STORE, announcement).await {
            warn!(user_id = %id, error = %e, "Failed to announce user_created");
        }

        ctx.store.find_by_id(&id).await.map_err(Into::into)
    }
}

#[derive(Debug, Deserialize)]
struct GetInput {
    id: String,
}

/// Answers `get_user` reference lookups from other services.
pub struct GetUserHandler;

#[async_trait]
impl EventHandler for GetUserHandler {
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

/// Wire up the User service runtime.
pub fn user_service(
    config: ServiceConfig,
    deps: ServiceDeps,
) -> eg_service::Result<Arc<ServiceRuntime>> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(events::CREATE_USER, Arc::new(CreateUserHandler))?;
    handlers.register(events::GET_USER, Arc::new(GetUserHandler))?;
    Ok(ServiceRuntime::new("user", config, deps, handlers))
}
