//! Server error types

use apiary_core::error::codes;
use apiary_core::{AuthError, DispatchError, Envelope, SessionError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors that can occur in the apiary server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Invalid message format
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(e) if e.is_unauthorized() => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::UserExists) => StatusCode::CONFLICT,
            Self::Auth(AuthError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::BAD_REQUEST,
            Self::Session(SessionError::AlreadyReserved(_) | SessionError::AlreadyExists(_)) => {
                StatusCode::CONFLICT
            }
            Self::Session(e) if e.is_precondition() => StatusCode::BAD_REQUEST,
            Self::Session(SessionError::Unsupported(_)) => StatusCode::NOT_IMPLEMENTED,
            Self::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Dispatch(DispatchError::UnknownCommand(_)) => StatusCode::NOT_FOUND,
            Self::Dispatch(_) | Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::Bind { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::Session(e) => e.code(),
            Self::Dispatch(e) => e.code(),
            Self::InvalidMessage(_) => codes::INVALID_PARAMS,
            Self::Bind { .. } | Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether the caller's token should be treated as no longer valid
    pub fn is_unauthorized(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }

    /// Render as a failure envelope, keeping driver detail as the trace
    pub fn to_envelope(&self) -> Envelope {
        let stack = match self {
            Self::Session(e) => e.detail().map(str::to_string),
            _ => None,
        };
        Envelope::err(self.to_string(), self.code()).with_stack(stack)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        (status, Json(self.to_envelope())).into_response()
    }
}
