//! Event channel connection handling

use std::sync::Arc;
use std::time::Duration;

use apiary_core::error::codes;
use apiary_core::{
    AuthError, Command, Envelope, EventSeq, Identity, IdentityProvider, SessionEventEnvelope,
};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{AppState, commands, middleware::authenticate};

use super::protocol::{ClientMessage, ServerMessage, event_frame};

/// How long a new channel may stay unauthenticated
pub const AUTH_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Frames tolerated before the auth frame arrives
pub const AUTH_GRACE_FRAMES: usize = 3;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// An event channel that passed the handshake
struct Authenticated {
    identity: Identity,
    events: broadcast::Receiver<(EventSeq, SessionEventEnvelope)>,
    /// Fires when the session is removed (logout, reaping, token rejection)
    ended: Arc<CancellationToken>,
}

/// Handle an event channel
///
/// A single writer task owns the sink; the reader, the event forwarder and
/// command tasks all feed it through `out`. The channel closes when the
/// client goes away, the session is removed, the forwarder falls behind, or
/// a command arrives after the token expired.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out, mut outbox) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    debug!("Event channel opened");

    let Some(Authenticated {
        identity,
        events,
        ended,
    }) = handshake(&mut receiver, &state, &out).await
    else {
        drop(out);
        let _ = writer.await;
        debug!("Event channel closed before authentication");
        return;
    };

    let session_id = IdentityProvider::session_id_for(&identity);
    info!(session_id = %session_id, "Event channel authenticated");

    let mut forwarder = tokio::spawn(forward_events(
        events,
        session_id.clone(),
        out.clone(),
    ));

    loop {
        tokio::select! {
            _ = ended.cancelled() => {
                info!(session_id = %session_id, "Session ended, closing event channel");
                send(&out, &auth_error("Session ended", codes::NO_SESSION));
                break;
            }
            _ = &mut forwarder => break,
            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        if !handle_text_message(&text, &state, &identity, &out) {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Event channel client sent close frame");
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        if out.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        // Ignore binary and pong messages
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    forwarder.abort();
    drop(out);
    let _ = writer.await;
    info!(session_id = %session_id, "Event channel closed");
}

/// Wait for the auth frame within the grace window
async fn handshake(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    out: &mpsc::UnboundedSender<Message>,
) -> Option<Authenticated> {
    let deadline = tokio::time::Instant::now() + AUTH_GRACE_PERIOD;
    let mut stray_frames = 0;

    while stray_frames < AUTH_GRACE_FRAMES {
        let msg = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Event channel failed during handshake");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                debug!("Event channel handshake timed out");
                send(out, &auth_error("Authentication timed out", codes::MISSING_TOKEN));
                return None;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            Message::Ping(data) => {
                let _ = out.send(Message::Pong(data));
                continue;
            }
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token }) => {
                return match authenticate(state, &token).await {
                    Ok(identity) => {
                        let session_id = IdentityProvider::session_id_for(&identity);
                        // Subscribe before auth:ok goes out so no event after it can be missed
                        let events = state.event_bus.subscribe(&session_id);
                        let ended = state.registry.ended(&session_id);
                        send(
                            out,
                            &ServerMessage::AuthOk {
                                user_id: identity.user_id.clone(),
                                session_id,
                            },
                        );
                        Some(Authenticated {
                            identity,
                            events,
                            ended,
                        })
                    }
                    Err(e) => {
                        send(out, &auth_error(e.to_string(), e.code()));
                        None
                    }
                };
            }
            Ok(_) | Err(_) => {
                stray_frames += 1;
                send(
                    out,
                    &ServerMessage::error("Authenticate first", codes::MISSING_TOKEN),
                );
            }
        }
    }

    send(out, &auth_error("Authentication required", codes::MISSING_TOKEN));
    None
}

/// Handle a text frame from an authenticated client
///
/// Returns false when the channel must close.
fn handle_text_message(
    text: &str,
    state: &Arc<AppState>,
    identity: &Identity,
    out: &mpsc::UnboundedSender<Message>,
) -> bool {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "Unparseable frame");
            send(out, &ServerMessage::error(e.to_string(), codes::INVALID_PARAMS));
            return true;
        }
    };

    match client_msg {
        ClientMessage::Ping => send(out, &ServerMessage::Pong),
        ClientMessage::Auth { .. } => {
            debug!("Ignoring repeated auth frame");
        }
        ClientMessage::Command {
            request_id,
            command,
            args,
        } => {
            if state.identity.is_expired(identity) {
                let err = AuthError::Expired;
                info!(user_id = %identity.user_id, "Token expired, closing event channel");
                send(out, &auth_error(err.to_string(), err.code()));
                return false;
            }

            let state = Arc::clone(state);
            let identity = identity.clone();
            let out = out.clone();
            tokio::spawn(async move {
                let envelope = match run_command(&state, &identity, &command, args).await {
                    Ok(data) => Envelope::ok(data),
                    Err(e) => e.to_envelope(),
                };
                send(&out, &ServerMessage::CommandResult { request_id, envelope });
            });
        }
    }
    true
}

async fn run_command(
    state: &AppState,
    identity: &Identity,
    name: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, crate::ServerError> {
    let command = Command::from_name(name)?;
    commands::execute(state, Some(identity), command, args).await
}

/// Forward this session's events until the channel goes away
///
/// A forwarder that falls behind reports it and stops; the channel then
/// closes so the client reconnects instead of silently missing terminal
/// events.
async fn forward_events(
    mut rx: broadcast::Receiver<(EventSeq, SessionEventEnvelope)>,
    session_id: String,
    out: mpsc::UnboundedSender<Message>,
) {
    loop {
        match rx.recv().await {
            Ok((_seq, envelope)) => match event_frame(&envelope.event) {
                Ok(json) => {
                    if out.send(Message::Text(json)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Closed) => {
                warn!(session_id = %session_id, "Event bus channel closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(session_id = %session_id, "Event forwarding lagged by {} events", count);
                send(
                    &out,
                    &ServerMessage::error(
                        format!("Event channel fell behind by {count} events"),
                        codes::EVENTS_LAGGED,
                    ),
                );
                break;
            }
        }
    }
}

fn auth_error(error: impl Into<String>, code: &str) -> ServerMessage {
    ServerMessage::AuthError {
        error: error.into(),
        code: code.to_string(),
    }
}

fn send(out: &mpsc::UnboundedSender<Message>, frame: &ServerMessage) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = out.send(Message::Text(json));
        }
        Err(e) => warn!(error = %e, "Failed to serialize frame"),
    }
}
