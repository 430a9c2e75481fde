//! HTTP ingress surface.
//!
//! - `POST /operations/{operation}` - submit an operation body
//! - `GET  /health`                 - basic health
//! - `POST /config/routes/reload`   - hot-reload the routing table

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::router::{GatewayRouter, RouteOutcome};

/// State shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<GatewayRouter>,
    /// Routing file used by the reload endpoint, when configured.
    pub routing_path: Option<PathBuf>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/operations/:operation", post(submit_operation))
        .route("/config/routes/reload", post(reload_routes))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn submit_operation(
    State(state): State<ApiState>,
    Path(operation): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state.router.route(&operation, body).await {
        Ok(RouteOutcome::Accepted { event_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "ACCEPTED",
                "event_id": event_id,
            })),
        )
            .into_response(),
        Ok(RouteOutcome::Reply(data)) => (StatusCode::OK, Json(data)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn reload_routes(State(state): State<ApiState>) -> Response {
    let Some(path) = state.routing_path.as_ref() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "no routing file configured; table was built in-process",
            })),
        )
            .into_response();
    };

    match state.router.routing().reload_from_file(path) {
        Ok(routes) => {
            info!(routes = routes, path = %path.display(), "Routing table reloaded");
            (StatusCode::OK, Json(json!({ "routes": routes }))).into_response()
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Routing reload failed, keeping current table");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn error_response(error: GatewayError) -> Response {
    let status = match &error {
        GatewayError::UnknownOperation(_) => StatusCode::NOT_FOUND,
        GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Downstream(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error.to_body())).into_response()
}
