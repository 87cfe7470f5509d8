//! Error types for apiary-core

use thiserror::Error;

use crate::query::OperationId;
use crate::session::TabId;

/// Machine-readable error codes carried in response envelopes
pub mod codes {
    /// Identity token could not be verified.
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    /// Identity token is past its expiry.
    pub const EXPIRED_TOKEN: &str = "EXPIRED_TOKEN";
    /// Request carried no identity token.
    pub const MISSING_TOKEN: &str = "MISSING_TOKEN";
    /// Username/password pair rejected.
    pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
    /// Username already registered.
    pub const USER_EXISTS: &str = "USER_EXISTS";
    /// No session for the caller.
    pub const NO_SESSION: &str = "NO_SESSION";
    /// Session exists but holds no connection.
    pub const NO_CONNECTION: &str = "NO_CONNECTION";
    /// Tab holds no transaction reservation.
    pub const NO_RESERVATION: &str = "NO_RESERVATION";
    /// Operation id was never issued in this session.
    pub const NO_SUCH_OPERATION: &str = "NO_SUCH_OPERATION";
    /// Tab already holds a reservation.
    pub const ALREADY_RESERVED: &str = "ALREADY_RESERVED";
    /// Session id already registered.
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    /// Driver failed to open or probe a connection.
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    /// Driver failed to run a statement.
    pub const QUERY_ERROR: &str = "QUERY_ERROR";
    /// Command name not in the catalog.
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    /// Arguments missing or malformed.
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    /// Feature not offered by the active driver.
    pub const NOT_SUPPORTED: &str = "NOT_SUPPORTED";
    /// Unexpected internal failure.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    /// Event channel fell behind its session's events and was closed.
    pub const EVENTS_LAGGED: &str = "EVENTS_LAGGED";
}

/// Errors raised by database drivers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Opening or probing the connection failed; message is the driver's own
    #[error("{0}")]
    Connection(String),

    /// A statement failed
    #[error("{message}")]
    Query {
        message: String,
        detail: Option<String>,
    },

    /// No driver is registered for this connection type
    #[error("Database type {0} is not supported")]
    UnsupportedType(String),

    /// The driver does not offer this capability
    #[error("{0} is not supported by this driver")]
    Unsupported(String),

    /// The running statement was interrupted by a cancel request
    #[error("Statement was interrupted")]
    Interrupted,

    /// The driver was used before `open` or after `close`
    #[error("Not connected to database")]
    NotOpen,

    /// A blocking driver task panicked or was dropped
    #[error("Driver task failed: {0}")]
    Task(String),
}

impl DriverError {
    /// Build a query error without diagnostic detail
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            detail: None,
        }
    }
}

/// Errors raised by the session registry, connection controller and query engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session not found or expired")]
    NoSession,

    #[error("No database connection found")]
    NoConnection,

    #[error("No transaction reservation for tab {0}")]
    NoReservation(TabId),

    #[error("Query not found: {0}")]
    NoSuchOperation(OperationId),

    #[error("Tab {0} already holds a transaction reservation")]
    AlreadyReserved(TabId),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("No connection config provided")]
    MissingConfig,

    #[error("No username provided")]
    MissingIdentity,

    #[error("Connection attempt was aborted")]
    AttemptAborted,

    /// Remote failure while opening a connection
    #[error("{message}")]
    Connection { message: String },

    /// Remote failure while running a statement
    #[error("{message}")]
    Query {
        message: String,
        detail: Option<String>,
    },

    #[error("{0}")]
    Unsupported(String),
}

impl SessionError {
    /// Wrap a driver failure that happened while opening a connection
    pub fn connection(err: DriverError) -> Self {
        match err {
            DriverError::Unsupported(what) => Self::Unsupported(format!("{what} is not supported")),
            other => Self::Connection {
                message: other.to_string(),
            },
        }
    }

    /// Wrap a driver failure that happened while running a statement
    pub fn query(err: DriverError) -> Self {
        match err {
            DriverError::Query { message, detail } => Self::Query { message, detail },
            DriverError::Unsupported(what) => {
                Self::Unsupported(format!("{what} is not supported by this driver"))
            }
            other => Self::Query {
                message: other.to_string(),
                detail: None,
            },
        }
    }

    /// Stable code for the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSession => codes::NO_SESSION,
            Self::NoConnection => codes::NO_CONNECTION,
            Self::NoReservation(_) => codes::NO_RESERVATION,
            Self::NoSuchOperation(_) => codes::NO_SUCH_OPERATION,
            Self::AlreadyReserved(_) => codes::ALREADY_RESERVED,
            Self::AlreadyExists(_) => codes::ALREADY_EXISTS,
            Self::MissingConfig | Self::MissingIdentity => codes::INVALID_PARAMS,
            Self::AttemptAborted | Self::Connection { .. } => codes::CONNECTION_ERROR,
            Self::Query { .. } => codes::QUERY_ERROR,
            Self::Unsupported(_) => codes::NOT_SUPPORTED,
        }
    }

    /// Diagnostic detail passed through from the driver, if any
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Query { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }

    /// True for caller errors (missing session, connection, reservation, ...)
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NoSession
                | Self::NoConnection
                | Self::NoReservation(_)
                | Self::NoSuchOperation(_)
                | Self::AlreadyReserved(_)
                | Self::AlreadyExists(_)
                | Self::MissingConfig
                | Self::MissingIdentity
        )
    }
}

/// Errors raised while resolving a command against the catalog
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A `:param` path segment had no matching argument
    #[error("Command {command} requires argument '{param}'")]
    MissingParam { command: String, param: String },

    #[error("Invalid arguments: {0}")]
    InvalidParams(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCommand(_) => codes::UNKNOWN_COMMAND,
            Self::MissingParam { .. } | Self::InvalidParams(_) => codes::INVALID_PARAMS,
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}
