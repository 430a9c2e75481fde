//! Domain services: Organization, User and Store.
//!
//! Each service owns one entity kind, one queue and one store namespace.
//! Ownership links (Organization → User → Store) are established through
//! events only: the User service verifies `organization_id` against the
//! Organization service via request-reply, and announces each created user
//! to the Store service, which keeps a local set of known owner ids.

pub mod entities;
pub mod organization;
pub mod store;
pub mod user;

mod support;

pub use entities::{Organization, Store, User};
pub use organization::organization_service;
pub use store::store_service;
pub use user::user_service;

/// Queue names, one durable queue per domain service.
pub mod queues {
    pub const ORGANIZATION: &str = "organization";
    pub const USER: &str = "user";
    pub const STORE: &str = "store";
}

/// Event name vocabulary.
pub mod events {
    pub const CREATE_ORGANIZATION: &str = "create_organization";
    pub const GET_ORGANIZATION: &str = "get_organization";
    pub const CREATE_USER: &str = "create_user";
    pub const GET_USER: &str = "get_user";
    pub const USER_CREATED: &str = "user_created";
    pub const CREATE_STORE: &str = "create_store";
    pub const GET_STORE: &str = "get_store";
}
