//! Authentication error types

use thiserror::Error;

use crate::error::codes;

/// Errors that can occur during authentication
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// No authentication token was provided in the request
    #[error("No authentication token provided")]
    MissingToken,

    /// The token is malformed or its signature does not verify
    #[error("Invalid authentication token")]
    InvalidToken(String),

    /// The token has expired
    #[error("Authentication token expired")]
    Expired,

    /// Username/password pair was rejected
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Username or password missing from the request
    #[error("Username and password are required")]
    MissingCredentials,

    /// Password shorter than the minimum length
    #[error("Password must be at least {0} characters")]
    WeakPassword(usize),

    /// Username is already registered
    #[error("Username already exists")]
    UserExists,

    /// Token could not be signed
    #[error("Failed to issue token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Stable code for the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => codes::MISSING_TOKEN,
            Self::InvalidToken(_) => codes::INVALID_TOKEN,
            Self::Expired => codes::EXPIRED_TOKEN,
            Self::InvalidCredentials => codes::INVALID_CREDENTIALS,
            Self::MissingCredentials | Self::WeakPassword(_) => codes::INVALID_PARAMS,
            Self::UserExists => codes::USER_EXISTS,
            Self::Signing(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether the caller's identity is no longer valid (401-equivalent)
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::MissingToken | Self::InvalidToken(_) | Self::Expired | Self::InvalidCredentials
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::InvalidToken(err.to_string()),
        }
    }
}
