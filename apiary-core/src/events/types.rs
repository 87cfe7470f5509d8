//! Event type definitions

use serde::{Deserialize, Serialize};

use crate::driver::RowSet;
use crate::query::OperationId;
use crate::session::{SessionId, TabId};

/// Events pushed to a session's listeners
///
/// Serialized as `{type, ...payload}`; query events are correlated by the
/// caller-supplied `correlation_id` together with the server-assigned
/// `operation_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A cancelable statement was issued
    #[serde(rename = "query:start")]
    QueryStart {
        correlation_id: String,
        operation_id: OperationId,
    },

    /// Result set of a cancelable statement
    #[serde(rename = "query:data")]
    QueryData {
        correlation_id: String,
        operation_id: OperationId,
        result: RowSet,
    },

    /// A cancelable statement failed
    #[serde(rename = "query:error")]
    QueryError {
        correlation_id: String,
        operation_id: OperationId,
        error: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// A cancelable statement completed normally
    #[serde(rename = "query:complete")]
    QueryComplete {
        correlation_id: String,
        operation_id: OperationId,
        row_count: u64,
    },

    /// A cancelable statement stopped because of a cancel request
    #[serde(rename = "query:cancelled")]
    QueryCancelled {
        correlation_id: String,
        operation_id: OperationId,
    },

    /// A tab's reservation sat idle too long and was rolled back and released
    #[serde(rename = "transaction:timeout")]
    TransactionTimeout {
        tab_id: TabId,
        rolled_back: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SessionEvent {
    /// Wire name of the event (`query:start`, ...)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::QueryStart { .. } => "query:start",
            Self::QueryData { .. } => "query:data",
            Self::QueryError { .. } => "query:error",
            Self::QueryComplete { .. } => "query:complete",
            Self::QueryCancelled { .. } => "query:cancelled",
            Self::TransactionTimeout { .. } => "transaction:timeout",
        }
    }

    /// Operation this event belongs to, for query events
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::QueryStart { operation_id, .. }
            | Self::QueryData { operation_id, .. }
            | Self::QueryError { operation_id, .. }
            | Self::QueryComplete { operation_id, .. }
            | Self::QueryCancelled { operation_id, .. } => Some(*operation_id),
            Self::TransactionTimeout { .. } => None,
        }
    }

    /// Whether this is the last event an operation will produce
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::QueryError { .. } | Self::QueryComplete { .. } | Self::QueryCancelled { .. }
        )
    }
}

/// An event addressed to one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEventEnvelope {
    pub session_id: SessionId,
    pub event: SessionEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_type_name() {
        let event = SessionEvent::QueryCancelled {
            correlation_id: "c-1".to_string(),
            operation_id: OperationId(4),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "query:cancelled");
        assert_eq!(json["correlation_id"], "c-1");
        assert_eq!(json["operation_id"], 4);
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let events = vec![
            SessionEvent::QueryStart {
                correlation_id: "c".to_string(),
                operation_id: OperationId(1),
            },
            SessionEvent::QueryComplete {
                correlation_id: "c".to_string(),
                operation_id: OperationId(1),
                row_count: 0,
            },
            SessionEvent::TransactionTimeout {
                tab_id: 2,
                rolled_back: true,
                error: None,
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn terminal_events() {
        let start = SessionEvent::QueryStart {
            correlation_id: "c".to_string(),
            operation_id: OperationId(1),
        };
        let cancelled = SessionEvent::QueryCancelled {
            correlation_id: "c".to_string(),
            operation_id: OperationId(1),
        };
        assert!(!start.is_terminal());
        assert!(cancelled.is_terminal());
        assert_eq!(cancelled.operation_id(), Some(OperationId(1)));
    }
}
