//! Administrator authentication

pub mod admin_auth;

pub use admin_auth::{admin_auth_middleware, AdminIdentity};
