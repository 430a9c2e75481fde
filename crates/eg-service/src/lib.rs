//! Domain service runtime.
//!
//! Each domain service binds exactly one durable queue and processes its
//! events through a handler table:
//! - [`HandlerRegistry`]: explicit event-name → handler mapping, validated
//!   at registration
//! - [`ServiceRuntime`]: poll loop with bounded worker slots, per-failure
//!   retry/dead-letter policy, reply emission, idempotent replay handling
//!
//! Runtimes are built by explicit construction: store client, broker
//! clients and the handler table are passed in; there is no ambient
//! registry.

pub mod error;
pub mod registry;
pub mod runtime;

pub use error::{HandlerError, RegistryError, ServiceError};
pub use registry::{EventHandler, HandlerContext, HandlerRegistry};
pub use runtime::{ServiceDeps, ServiceRuntime};

pub type Result<T> = std::result::Result<T, ServiceError>;
