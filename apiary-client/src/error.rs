//! Client error types

use apiary_core::error::codes;
use apiary_core::DispatchError;
use thiserror::Error;

/// Errors returned by [`crate::ApiClient`] and [`crate::EventBridge`]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The command could not be resolved locally; nothing was sent
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The server rejected the caller's identity; the stored token is cleared
    #[error("{message}")]
    Unauthorized { message: String, code: Option<String> },

    /// The server answered with a failure envelope
    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
        /// Diagnostic trace supplied by the server
        stack: Option<String>,
        status: u16,
    },

    /// A command needs a token and none is stored
    #[error("Not logged in")]
    NotAuthenticated,

    /// The event bridge was torn down
    #[error("Event bridge is closed")]
    Closed,

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Machine code, when the server or the local resolver supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Dispatch(e) => Some(e.code()),
            Self::Unauthorized { code, .. } | Self::Remote { code, .. } => code.as_deref(),
            Self::NotAuthenticated => Some(codes::MISSING_TOKEN),
            _ => None,
        }
    }

    /// Remote diagnostic trace, if any
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::NotAuthenticated)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(err.to_string())
    }
}
