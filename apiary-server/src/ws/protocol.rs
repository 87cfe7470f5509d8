//! Event channel frame types
//!
//! Every frame is a JSON object tagged by `type`. Besides the control frames
//! below, the server forwards [`SessionEvent`]s in their own
//! `{type, ...payload}` form.

use apiary_core::{Envelope, SessionEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake; must be the first frame on the channel
    Auth { token: String },

    /// Keepalive
    Ping,

    /// Run a catalog command over the channel
    Command {
        /// Echoed back in the matching `command:result`
        request_id: String,
        /// Catalog name, e.g. `conn/listTables`
        command: String,
        #[serde(default)]
        args: Value,
    },
}

/// Control frames sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake accepted
    #[serde(rename = "auth:ok")]
    AuthOk { user_id: String, session_id: String },

    /// Handshake rejected; the server closes the channel after sending it
    #[serde(rename = "auth:error")]
    AuthError { error: String, code: String },

    /// A frame could not be handled
    #[serde(rename = "error")]
    Error { message: String, code: String },

    #[serde(rename = "pong")]
    Pong,

    /// Response to a `command` frame
    #[serde(rename = "command:result")]
    CommandResult {
        request_id: String,
        #[serde(flatten)]
        envelope: Envelope,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.into(),
        }
    }
}

/// Serialize a session event as a channel frame
pub fn event_frame(event: &SessionEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
