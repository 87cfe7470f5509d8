//! apiary-server - HTTP and WebSocket front end for apiary sessions
//!
//! Every command in the [`apiary_core::Command`] catalog is served at
//! `/api` + its route and answers with the uniform [`apiary_core::Envelope`].
//! Pushed session events travel over `/ws` after an auth handshake.

pub mod commands;
mod config;
mod error;
pub mod http;
pub mod middleware;
mod state;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use apiary_core::spawn_reaper;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use config::ServerConfig;
pub use error::ServerError;
pub use http::create_router;
pub use middleware::{authenticate, require_identity};
pub use state::AppState;

/// The main apiary server
pub struct ApiaryServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl ApiaryServer {
    /// Create a new server with default state
    pub fn new(config: ServerConfig) -> Self {
        let state = Arc::new(AppState::new(&config));
        Self { config, state }
    }

    /// Create a server with custom state (for testing)
    pub fn with_state(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the shared application state
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Run the server, binding to the configured address
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.clone(),
                source: e,
            })?;

        self.run_with_listener(listener).await
    }

    /// Run the server on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        tracing::info!("apiary server listening on {}", addr);

        if self.config.identity.uses_default_secret() {
            tracing::warn!(
                "Signing identity tokens with the built-in secret; set APIARY_SECRET for any shared deployment"
            );
        }

        let shutdown = CancellationToken::new();
        let reaper = spawn_reaper(self.state.registry.clone(), shutdown.clone());

        let router = create_router(self.state);
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ServerError::Internal(e.to_string()));

        shutdown.cancel();
        let _ = reaper.await;
        result
    }
}
