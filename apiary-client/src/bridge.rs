//! Event bridge: a lazily opened, authenticated event channel
//!
//! The bridge moves through `Disconnected -> Connecting -> Open` and back to
//! `Disconnected` when the transport drops. It reconnects only when asked to
//! (registering a listener, sending a frame), never from a background loop.
//! After [`EventBridge::close`] it stays `Closed` for good.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use apiary_core::{Command, Envelope};
use apiary_server::ws::ClientMessage;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::token::TokenStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of an [`EventBridge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Open,
    /// Torn down; terminal
    Closed,
}

/// Callback receiving the full `{type, ...payload}` frame
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`EventBridge::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registered {
    id: ListenerId,
    event_type: String,
    callback: Listener,
}

struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

struct Shared {
    url: Url,
    tokens: Arc<TokenStore>,
    state: Mutex<BridgeState>,
    link: Mutex<Option<Link>>,
    /// Replaced wholesale on every change; dispatch works on a snapshot
    listeners: RwLock<Arc<Vec<Registered>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    next_listener: AtomicU64,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Multiplexes pushed events to listeners by event type
#[derive(Clone)]
pub struct EventBridge {
    shared: Arc<Shared>,
}

impl EventBridge {
    /// Bridge to the channel at `url` (e.g. `ws://127.0.0.1:3000/ws`)
    pub fn new(url: Url, tokens: Arc<TokenStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url,
                tokens,
                state: Mutex::new(BridgeState::Disconnected),
                link: Mutex::new(None),
                listeners: RwLock::new(Arc::new(Vec::new())),
                pending: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.shared.state.lock()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().len()
    }

    /// Register `callback` for frames whose `type` is `event_type`
    ///
    /// Opens the channel if it is not open yet. A failed connection attempt
    /// is logged and leaves the listener registered; the next registration
    /// or send tries again.
    pub async fn add_listener<F>(&self, event_type: &str, callback: F) -> Result<ListenerId, ClientError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if self.state() == BridgeState::Closed {
            return Err(ClientError::Closed);
        }

        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        {
            let mut listeners = self.shared.listeners.write();
            let mut next = Vec::clone(&listeners);
            next.push(Registered {
                id,
                event_type: event_type.to_string(),
                callback: Arc::new(callback),
            });
            *listeners = Arc::new(next);
        }

        match self.ensure_open().await {
            Ok(()) => {}
            Err(ClientError::NotAuthenticated) => {
                debug!(event_type, "Listener registered before login; channel stays closed");
            }
            Err(e) => warn!(error = %e, "Event channel connection failed"),
        }
        Ok(id)
    }

    /// Unregister a listener, returning whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        if !listeners.iter().any(|l| l.id == id) {
            return false;
        }
        let next: Vec<Registered> = listeners.iter().filter(|l| l.id != id).cloned().collect();
        *listeners = Arc::new(next);
        true
    }

    /// Deliver a locally produced event through the same path as remote ones
    pub fn emit_local(&self, event: Value) {
        self.shared.dispatch(&event);
    }

    /// Send a frame, opening the channel first if needed
    pub async fn send(&self, frame: &ClientMessage) -> Result<(), ClientError> {
        self.ensure_open().await?;
        let text = serde_json::to_string(frame)?;
        let link = self.shared.link.lock();
        let link = link
            .as_ref()
            .ok_or_else(|| ClientError::Socket("event channel is not open".to_string()))?;
        link.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::Socket("event channel is not open".to_string()))
    }

    /// Run a catalog command over the channel and wait for its result
    pub async fn command(&self, name: &str, args: Value) -> Result<Value, ClientError> {
        Command::from_name(name)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id.clone(), tx);

        let frame = ClientMessage::Command {
            request_id: request_id.clone(),
            command: name.to_string(),
            args,
        };
        if let Err(e) = self.send(&frame).await {
            self.shared.pending.lock().remove(&request_id);
            return Err(e);
        }

        let envelope = rx
            .await
            .map_err(|_| ClientError::Socket("event channel closed before the result arrived".to_string()))?;
        envelope.into_result().map_err(|failure| ClientError::Remote {
            message: failure.message,
            code: failure.code,
            stack: failure.stack,
            status: 0,
        })
    }

    /// Open the channel now if there are listeners waiting for it
    pub async fn reconnect_if_listening(&self) -> Result<(), ClientError> {
        if self.listener_count() == 0 {
            return Ok(());
        }
        self.ensure_open().await
    }

    /// Tear down: close the transport, drop every listener, never reconnect
    pub fn close(&self) {
        *self.shared.state.lock() = BridgeState::Closed;
        if let Some(link) = self.shared.link.lock().take() {
            let _ = link.outgoing.send(Message::Close(None));
            link.reader.abort();
        }
        *self.shared.listeners.write() = Arc::new(Vec::new());
        self.shared.pending.lock().clear();
        debug!("Event bridge closed");
    }

    async fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state() {
            BridgeState::Open => return Ok(()),
            BridgeState::Closed => return Err(ClientError::Closed),
            _ => {}
        }

        let _connecting = self.shared.connect_lock.lock().await;
        match self.state() {
            BridgeState::Open => return Ok(()),
            BridgeState::Closed => return Err(ClientError::Closed),
            _ => {}
        }

        let token = self.shared.tokens.get().ok_or(ClientError::NotAuthenticated)?;
        *self.shared.state.lock() = BridgeState::Connecting;
        debug!(url = %self.shared.url, "Opening event channel");

        let ws = match connect_async(self.shared.url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                self.shared.set_state_unless_closed(BridgeState::Disconnected);
                return Err(e.into());
            }
        };

        let (mut sink, stream) = ws.split();
        let (outgoing, mut outbox) = mpsc::unbounded_channel::<Message>();
        let auth = serde_json::to_string(&ClientMessage::Auth { token })?;
        let _ = outgoing.send(Message::Text(auth.into()));

        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(read_frames(Arc::downgrade(&self.shared), stream, generation));

        let mut state = self.shared.state.lock();
        if *state == BridgeState::Closed {
            reader.abort();
            return Err(ClientError::Closed);
        }
        *self.shared.link.lock() = Some(Link {
            generation,
            outgoing,
            reader,
        });
        *state = BridgeState::Open;
        debug!(generation, "Event channel open");
        Ok(())
    }
}

impl Shared {
    fn set_state_unless_closed(&self, next: BridgeState) {
        let mut state = self.state.lock();
        if *state != BridgeState::Closed {
            *state = next;
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        if frame["type"] == "command:result" {
            let Some(request_id) = frame["request_id"].as_str() else {
                warn!("command:result without request_id");
                return;
            };
            let waiter = self.pending.lock().remove(request_id);
            match (waiter, serde_json::from_value::<Envelope>(frame.clone())) {
                (Some(waiter), Ok(envelope)) => {
                    let _ = waiter.send(envelope);
                }
                (None, _) => debug!(request_id, "Result for unknown request"),
                (_, Err(e)) => warn!(error = %e, "Malformed command result"),
            }
            return;
        }

        // The server refused or ended this token; later calls must log in again
        if frame["type"] == "auth:error" && self.tokens.clear() {
            debug!(code = ?frame["code"].as_str(), "Channel rejected token, cleared credentials");
        }

        self.dispatch(&frame);
    }

    fn dispatch(&self, frame: &Value) {
        let Some(event_type) = frame["type"].as_str() else {
            warn!("Dropping frame without a type");
            return;
        };

        let listeners = Arc::clone(&self.listeners.read());
        let mut delivered = 0;
        for listener in listeners.iter().filter(|l| l.event_type == event_type) {
            delivered += 1;
            let callback = &listener.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                warn!(event_type, listener = listener.id.0, "Event listener panicked");
            }
        }

        if delivered == 0 {
            match event_type {
                "auth:ok" | "pong" => debug!(event_type, "Control frame"),
                _ => warn!(event_type, "No listener for event type"),
            }
        }
    }

    /// The reader for `generation` saw its transport end
    fn link_lost(&self, generation: u64) {
        let mut link = self.link.lock();
        if link.as_ref().map(|l| l.generation) != Some(generation) {
            return;
        }
        *link = None;
        drop(link);

        self.set_state_unless_closed(BridgeState::Disconnected);
        self.pending.lock().clear();
        debug!(generation, "Event channel lost");
    }
}

async fn read_frames(shared: Weak<Shared>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.handle_frame(text.as_str());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Event channel read failed");
                break;
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.link_lost(generation);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn offline_bridge() -> EventBridge {
        let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
        EventBridge::new(url, Arc::new(TokenStore::new()))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (count, move |_: &Value| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    // ==================== Dispatch Tests ====================

    #[tokio::test]
    async fn test_local_event_reaches_matching_listeners_only() {
        let bridge = offline_bridge();
        let (auth_errors, on_auth_error) = counter();
        let (timeouts, on_timeout) = counter();
        bridge.add_listener("auth:error", on_auth_error).await.unwrap();
        bridge.add_listener("transaction:timeout", on_timeout).await.unwrap();

        bridge.emit_local(json!({"type": "auth:error", "error": "Unauthorized"}));

        assert_eq!(auth_errors.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_channel_auth_error_clears_token() {
        let tokens = Arc::new(TokenStore::new());
        tokens.set("token");
        let bridge = EventBridge::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), tokens.clone());
        let (auth_errors, on_auth_error) = counter();
        bridge.add_listener("auth:error", on_auth_error).await.unwrap();

        bridge
            .shared
            .handle_frame(r#"{"type":"auth:error","error":"Session ended","code":"NO_SESSION"}"#);

        assert!(tokens.get().is_none());
        assert_eq!(auth_errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_frames_keep_token() {
        let tokens = Arc::new(TokenStore::new());
        tokens.set("token");
        let bridge = EventBridge::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), tokens.clone());

        bridge.shared.handle_frame(r#"{"type":"error","message":"x","code":"INVALID_PARAMS"}"#);
        bridge.shared.handle_frame(r#"{"type":"query:start","correlation_id":"c"}"#);
        assert_eq!(tokens.get().as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let bridge = offline_bridge();
        bridge
            .add_listener("query:data", |_: &Value| panic!("listener bug"))
            .await
            .unwrap();
        let (count, on_data) = counter();
        bridge.add_listener("query:data", on_data).await.unwrap();

        bridge.emit_local(json!({"type": "query:data"}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_and_untyped_frames_are_ignored() {
        let bridge = offline_bridge();
        bridge.emit_local(json!({"type": "hive:swarm"}));
        bridge.emit_local(json!({"payload": 1}));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn test_removed_listener_stops_receiving() {
        let bridge = offline_bridge();
        let (count, on_event) = counter();
        let id = bridge.add_listener("query:complete", on_event).await.unwrap();

        assert!(bridge.remove_listener(id));
        assert!(!bridge.remove_listener(id));
        bridge.emit_local(json!({"type": "query:complete"}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_may_register_during_dispatch() {
        let bridge = offline_bridge();
        let inner = bridge.clone();
        bridge
            .add_listener("query:start", move |_: &Value| {
                let bridge = inner.clone();
                tokio::spawn(async move {
                    let _ = bridge.add_listener("query:start", |_: &Value| {}).await;
                });
            })
            .await
            .unwrap();

        bridge.emit_local(json!({"type": "query:start"}));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(bridge.listener_count(), 2);
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_registration_without_token_stays_disconnected() {
        let bridge = offline_bridge();
        bridge.add_listener("query:start", |_: &Value| {}).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let tokens = Arc::new(TokenStore::new());
        tokens.set("token");
        let bridge = EventBridge::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), tokens);

        bridge.add_listener("query:start", |_: &Value| {}).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        assert_eq!(bridge.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let bridge = offline_bridge();
        bridge.add_listener("query:start", |_: &Value| {}).await.unwrap();

        bridge.close();
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(bridge.listener_count(), 0);
        assert!(matches!(
            bridge.add_listener("query:start", |_: &Value| {}).await,
            Err(ClientError::Closed)
        ));
        assert!(matches!(
            bridge.send(&ClientMessage::Ping).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_command_fails_locally() {
        let bridge = offline_bridge();
        let err = bridge.command("conn/nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::Dispatch(_)));
    }
}
