//! Identity tokens and user credentials

mod config;
mod credentials;
mod error;
mod identity;
mod provider;

pub use config::{DEFAULT_SIGNING_SECRET, IdentityConfig};
pub use credentials::{CredentialStore, MemoryCredentialStore, MIN_PASSWORD_LEN};
pub use error::AuthError;
pub use identity::{Identity, LoginResponse};
pub use provider::IdentityProvider;
