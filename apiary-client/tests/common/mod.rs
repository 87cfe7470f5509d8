//! Shared helpers for apiary-client integration tests

use std::net::SocketAddr;
use std::sync::Arc;

use apiary_client::ApiClient;
use apiary_core::MemoryCredentialStore;
use apiary_core::driver::{DriverRegistry, MemoryDriverFactory};
use apiary_server::{ApiaryServer, AppState, ServerConfig};
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// Spawns a server backed by the memory driver, returns state, address and driver
#[allow(dead_code)]
pub async fn spawn_server() -> (Arc<AppState>, SocketAddr, MemoryDriverFactory) {
    let memory = MemoryDriverFactory::new().with_tables(&["users", "orders"]);
    let drivers = DriverRegistry::with_defaults().register("memory", memory.clone());
    let config = ServerConfig::new("127.0.0.1", 0);
    let state = Arc::new(AppState::with_components(
        &config,
        Arc::new(drivers),
        Arc::new(MemoryCredentialStore::new()),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ApiaryServer::with_state(config, Arc::clone(&state));
    tokio::spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });

    // Brief delay to ensure server is accepting connections
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    (state, addr, memory)
}

/// A logged-in admin client
#[allow(dead_code)]
pub async fn admin_client(addr: SocketAddr) -> ApiClient {
    let client = ApiClient::new(&format!("http://{}", addr)).unwrap();
    client.login("admin", "admin").await.unwrap();
    client
}

#[allow(dead_code)]
pub fn memory_config() -> Value {
    json!({"config": {"connectionType": "memory", "database": "main"}})
}
