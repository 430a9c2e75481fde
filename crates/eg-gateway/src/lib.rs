//! Gateway router.
//!
//! Translates external requests into outbound events:
//! - [`GatewayRouter`]: routing-table lookup, input validation, one publish
//!   per request, correlated request-reply with timeout
//! - `api`: the axum HTTP ingress surface
//!
//! The gateway never touches an entity store; every effect happens in a
//! downstream domain service.

pub mod api;
pub mod error;
pub mod router;

pub use api::{create_router, ApiState};
pub use error::GatewayError;
pub use router::{GatewayRouter, RouteOutcome};

pub type Result<T> = std::result::Result<T, GatewayError>;
