//! Request middleware

mod auth;

pub use auth::{authenticate, bearer_token, require_identity};
