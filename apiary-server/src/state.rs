//! Shared application state for the apiary server

use std::sync::Arc;

use apiary_core::{
    ConnectionController, CredentialStore, DriverFactory, DriverRegistry, EventBus,
    IdentityProvider, MemoryCredentialStore, MemoryEventBus, QueryEngine, SessionRegistry,
};
use chrono::{DateTime, Utc};

use crate::ServerConfig;

/// Shared application state accessible by all handlers
#[derive(Clone)]
pub struct AppState {
    /// Every live session
    pub registry: Arc<SessionRegistry>,
    /// Creates and tears down session connections
    pub controller: Arc<ConnectionController>,
    /// Runs statements and manages reservations
    pub engine: QueryEngine,
    /// Issues and verifies identity tokens
    pub identity: Arc<IdentityProvider>,
    /// Username/password store behind login and register
    pub credentials: Arc<dyn CredentialStore>,
    /// Event bus for query progress and transaction timeouts
    pub event_bus: Arc<dyn EventBus>,
    /// When the server started
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create an AppState with every built-in driver and the in-memory user store
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_components(
            config,
            Arc::new(DriverRegistry::with_defaults()),
            Arc::new(MemoryCredentialStore::new()),
        )
    }

    /// Create AppState with custom components (for testing)
    pub fn with_components(
        config: &ServerConfig,
        drivers: Arc<dyn DriverFactory>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.clone()));
        let event_bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new(1024));

        Self {
            controller: Arc::new(ConnectionController::new(registry.clone(), drivers)),
            engine: QueryEngine::new(registry.clone(), event_bus.clone()),
            identity: Arc::new(IdentityProvider::new(config.identity.clone())),
            credentials,
            event_bus,
            registry,
            started_at: Utc::now(),
        }
    }

    /// Replace the query engine (e.g. to shorten timeouts in tests)
    pub fn with_engine(mut self, engine: QueryEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Returns how long the server has been running
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(&ServerConfig::default())
    }
}
