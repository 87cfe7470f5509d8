//! Event channel test client
//!
//! Note: Some methods may appear unused because they're only used in specific
//! test files and clippy checks each test independently.

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Low-level WebSocket connection
pub struct WsConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl WsConnection {
    /// Connect to the event channel
    pub async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}/ws", addr);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("Failed to connect");
        let (sink, stream) = ws.split();
        Self { sink, stream }
    }

    /// Send raw text message
    pub async fn send_raw(&mut self, msg: &str) {
        self.sink
            .send(Message::Text(msg.to_string().into()))
            .await
            .unwrap();
    }

    /// Send JSON message
    pub async fn send_json<T: Serialize>(&mut self, msg: &T) {
        let json = serde_json::to_string(msg).unwrap();
        self.send_raw(&json).await;
    }

    /// Receive the next text frame, `None` once the channel is closed
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }

    /// Receive raw text message
    pub async fn recv_raw(&mut self) -> String {
        self.next_text().await.expect("WebSocket closed")
    }

    /// Receive and deserialize JSON message
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> T {
        let text = self.recv_raw().await;
        serde_json::from_str(&text).expect("Failed to parse JSON")
    }

    /// Receive with timeout, returns None if timeout
    pub async fn recv_timeout(&mut self, duration: Duration) -> Option<String> {
        tokio::time::timeout(duration, self.recv_raw()).await.ok()
    }
}

/// Authenticated event channel client
pub struct TestClient {
    pub conn: WsConnection,
}

impl TestClient {
    /// Connect and complete the auth handshake
    #[allow(dead_code)]
    pub async fn connect(addr: SocketAddr, token: &str) -> Self {
        let mut conn = WsConnection::connect(addr).await;
        conn.send_json(&json!({"type": "auth", "token": token})).await;

        let auth_msg: Value = conn.recv_json().await;
        assert_eq!(
            auth_msg["type"], "auth:ok",
            "Expected auth:ok but got: {}",
            auth_msg
        );

        Self { conn }
    }

    /// Run a command over the channel, returns the `command:result` frame
    #[allow(dead_code)]
    pub async fn command(&mut self, command: &str, args: Value) -> Value {
        let request_id = Uuid::new_v4().to_string();
        self.conn
            .send_json(&json!({
                "type": "command",
                "request_id": request_id,
                "command": command,
                "args": args,
            }))
            .await;

        self.expect_type("command:result", Duration::from_secs(5))
            .await
    }

    /// Receive next message
    #[allow(dead_code)]
    pub async fn recv(&mut self) -> Value {
        self.conn.recv_json().await
    }

    /// Wait for the next frame of the given type, skipping others
    #[allow(dead_code)]
    pub async fn expect_type(&mut self, event_type: &str, timeout: Duration) -> Value {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Some(text) = self.conn.recv_timeout(Duration::from_millis(50)).await {
                let msg: Value = serde_json::from_str(&text).unwrap();
                if msg["type"] == event_type {
                    return msg;
                }
            }
        }
        panic!("Timeout waiting for {}", event_type);
    }

    /// Assert no message received within duration
    #[allow(dead_code)]
    pub async fn expect_no_message(&mut self, duration: Duration) {
        assert!(
            self.conn.recv_timeout(duration).await.is_none(),
            "Expected no message but received one"
        );
    }
}
