//! In-memory EventBus implementation
//!
//! MemoryEventBus keeps one broadcast channel per session. Channels are
//! created by the first subscriber and dropped once the last one goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::bus::{EventBus, EventSeq};
use super::types::{SessionEvent, SessionEventEnvelope};

type Channel = broadcast::Sender<(EventSeq, SessionEventEnvelope)>;

/// In-memory implementation of EventBus
pub struct MemoryEventBus {
    /// Buffered events per subscriber before it lags
    capacity: usize,
    /// Next sequence number to assign
    next_seq: AtomicU64,
    /// Live channels keyed by session id
    channels: Mutex<HashMap<String, Channel>>,
}

impl MemoryEventBus {
    /// Create a new MemoryEventBus with the given per-session channel capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions with at least one subscriber channel
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, session_id: &str, event: SessionEvent) -> EventSeq {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let Some(tx) = self.channels.lock().get(session_id).cloned() else {
            return seq;
        };

        let envelope = SessionEventEnvelope {
            session_id: session_id.to_string(),
            event,
        };
        if tx.send((seq, envelope)).is_err() {
            // Every subscriber of this session has gone away
            self.channels.lock().retain(|_, tx| tx.receiver_count() > 0);
        }
        seq
    }

    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<(EventSeq, SessionEventEnvelope)> {
        let mut channels = self.channels.lock();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}
