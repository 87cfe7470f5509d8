//! EventBus trait definition

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::{SessionEvent, SessionEventEnvelope};

/// Sequence number for events (monotonically increasing)
pub type EventSeq = u64;

/// Event bus for publishing and subscribing to session events
///
/// Each session has its own stream, so a slow subscriber of one session can
/// never cause another session's events to be dropped. Events published while
/// a session has no subscriber are discarded.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event for a session, returns its sequence number
    async fn publish(&self, session_id: &str, event: SessionEvent) -> EventSeq;

    /// Subscribe to a session's events from now (live stream)
    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<(EventSeq, SessionEventEnvelope)>;
}
