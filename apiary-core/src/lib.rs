//! apiary-core: Session-scoped database browsing
//!
//! This crate provides the building blocks behind the apiary server:
//!
//! - **Identity** - [`IdentityProvider`] issues and verifies signed tokens; a
//!   token's user id is the caller's session id
//! - **Sessions** - [`SessionRegistry`] owns each session's single connection,
//!   its running operations and its per-tab transaction reservations
//! - **Connections** - [`ConnectionController`] creates, tests and tears down
//!   the connection behind a session
//! - **Statements** - [`QueryEngine`] runs immediate and cancelable statements
//!   and guards reservations with idle timers
//! - **Commands** - [`Command`] is the catalog both server and client route by
//! - **Events** - [`EventBus`] carries query progress and timeouts to listeners
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use apiary_core::driver::{ConnectionConfig, DriverRegistry};
//! use apiary_core::{
//!     ConnectionController, Identity, MemoryEventBus, QueryEngine, SessionRegistry,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(SessionRegistry::default());
//!     let controller =
//!         ConnectionController::new(registry.clone(), Arc::new(DriverRegistry::with_defaults()));
//!     let engine = QueryEngine::new(registry, Arc::new(MemoryEventBus::default()));
//!
//!     let admin = Identity::new("1", "admin");
//!     let config = ConnectionConfig::new("sqlite", ":memory:");
//!     controller.create("1", Some(&config), Some(&admin)).await?;
//!
//!     let rows = engine.execute_immediate("1", "SELECT 1 AS one", None).await?;
//!     println!("{} row(s)", rows.row_count);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod connection;
pub mod de;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod query;
pub mod session;

// Re-export key types for convenience
pub use auth::{
    AuthError, CredentialStore, Identity, IdentityConfig, IdentityProvider, LoginResponse,
    MemoryCredentialStore,
};
pub use connection::ConnectionController;
pub use dispatch::{Command, Envelope, HttpMethod, Route};
pub use driver::{DatabaseDriver, DriverFactory, DriverRegistry, RowSet};
pub use error::{DispatchError, DriverError, SessionError};
pub use events::{EventBus, EventSeq, MemoryEventBus, SessionEvent, SessionEventEnvelope};
pub use query::{CancelOutcome, OperationId, QueryEngine, TransactionStep};
pub use session::{SessionId, SessionInfo, SessionPolicy, SessionRegistry, TabId, spawn_reaper};
