//! Timing policy for sessions and reservations

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session and transaction timing limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPolicy {
    /// Sessions older than this are reaped
    #[serde(default = "default_max_age")]
    pub max_session_age_secs: u64,

    /// How often the reaper sweeps
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Idle time after which a tab's reservation is rolled back and released
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,

    /// How long a cancel waits for the operation to acknowledge
    #[serde(default = "default_cancel_ack_timeout")]
    pub cancel_ack_timeout_ms: u64,
}

fn default_max_age() -> u64 {
    24 * 60 * 60
}

fn default_reap_interval() -> u64 {
    5 * 60
}

fn default_transaction_timeout() -> u64 {
    10 * 60
}

fn default_cancel_ack_timeout() -> u64 {
    5_000
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_session_age_secs: default_max_age(),
            reap_interval_secs: default_reap_interval(),
            transaction_timeout_secs: default_transaction_timeout(),
            cancel_ack_timeout_ms: default_cancel_ack_timeout(),
        }
    }
}

impl SessionPolicy {
    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }
}
