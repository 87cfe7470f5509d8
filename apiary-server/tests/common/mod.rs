//! Shared test utilities for apiary-server integration tests

pub mod client;

use std::net::SocketAddr;
use std::sync::Arc;

use apiary_core::MemoryCredentialStore;
use apiary_core::driver::{DriverRegistry, MemoryDriverFactory};
use apiary_server::{ApiaryServer, AppState, ServerConfig};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// A running server plus the memory driver behind its `memory` connections
#[allow(dead_code)]
pub struct TestServer {
    pub state: Arc<AppState>,
    pub addr: SocketAddr,
    pub memory: MemoryDriverFactory,
}

/// Creates a test server with default config, returns state and address
#[allow(dead_code)]
pub async fn create_test_server() -> (Arc<AppState>, SocketAddr) {
    let server = create_test_server_with_config(ServerConfig::default()).await;
    (server.state, server.addr)
}

/// Creates a test server with custom config
#[allow(dead_code)]
pub async fn create_test_server_with_config(config: ServerConfig) -> TestServer {
    let memory = MemoryDriverFactory::new().with_tables(&["users", "orders"]);
    let drivers = DriverRegistry::with_defaults().register("memory", memory.clone());
    let state = Arc::new(AppState::with_components(
        &config,
        Arc::new(drivers),
        Arc::new(MemoryCredentialStore::new()),
    ));

    let server = ApiaryServer::with_state(config, Arc::clone(&state));
    let addr = spawn_server(server).await;

    TestServer {
        state,
        addr,
        memory,
    }
}

/// Spawns server in background task, returns bound address
async fn spawn_server(server: ApiaryServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });

    // Brief delay to ensure server is accepting connections
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    addr
}

/// Log in as the seeded admin user, returns the token
#[allow(dead_code)]
pub async fn login_admin(addr: SocketAddr) -> String {
    let (status, body) = call(addr, None, "POST", "/api/auth/login", Some(json!({
        "username": "admin",
        "password": "admin",
    })))
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["data"]["token"].as_str().unwrap().to_string()
}

/// Make one HTTP call and return the status and decoded envelope
#[allow(dead_code)]
pub async fn call(
    addr: SocketAddr,
    token: Option<&str>,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let client = reqwest::Client::new();
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap();
    let mut request = client.request(method, format!("http://{}{}", addr, path));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.unwrap();
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

/// Connect the admin session to the in-memory driver
#[allow(dead_code)]
pub async fn connect_memory(addr: SocketAddr, token: &str) {
    let (status, body) = call(
        addr,
        Some(token),
        "POST",
        "/api/connections/create",
        Some(json!({"config": {"connectionType": "memory", "database": "main"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "connect failed: {}", body);
}
