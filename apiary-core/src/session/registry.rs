//! SessionRegistry owns every session
//!
//! Each session sits behind its own lock so operations on different sessions
//! never contend. The map lock is only held long enough to insert, look up or
//! take out an entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::driver::DatabaseDriver;
use crate::error::SessionError;

use super::policy::SessionPolicy;
use super::state::{Session, SessionId, SessionInfo};

/// Shared handle to one session's state
pub type SharedSession = Arc<Mutex<Session>>;

/// Consecutive rejected tokens after which a user's session is removed
pub const REJECTIONS_BEFORE_REMOVAL: u32 = 2;

/// Serializes connection creation for one session id
///
/// Exists independently of the session so the first create for an id is
/// serialized too, and so teardown can abort an attempt in flight.
#[derive(Default)]
pub struct ConnectGate {
    lock: Arc<Mutex<()>>,
    attempt: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ConnectGate {
    /// Wait for exclusive right to create a connection for this id
    pub async fn enter(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    /// Track a new attempt, returning the token that aborts it
    pub fn begin_attempt(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.attempt.lock() = Some(token.clone());
        token
    }

    pub fn end_attempt(&self) {
        self.attempt.lock().take();
    }

    /// Abort the attempt in flight, if any
    pub fn abort_attempt(&self) -> bool {
        match self.attempt.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Nobody but the registry holds or waits on this gate
    fn is_idle(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && self.lock.try_lock().is_ok()
    }
}

/// A session known to hold a connection, with the driver borrowed out
pub struct Connected {
    pub session: SharedSession,
    pub driver: Arc<dyn DatabaseDriver>,
}

/// In-memory table of sessions keyed by session id
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SharedSession>>,
    gates: parking_lot::Mutex<HashMap<SessionId, Arc<ConnectGate>>>,
    endings: parking_lot::Mutex<HashMap<SessionId, Arc<CancellationToken>>>,
    rejections: parking_lot::Mutex<HashMap<String, u32>>,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            gates: parking_lot::Mutex::new(HashMap::new()),
            endings: parking_lot::Mutex::new(HashMap::new()),
            rejections: parking_lot::Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Look up a session
    pub async fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Create a session; fails if one already exists for this id
    pub async fn create(&self, session_id: &str, user_id: &str) -> Result<SharedSession, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }
        let session = Arc::new(Mutex::new(Session::new(session_id, user_id)));
        sessions.insert(session_id.to_string(), session.clone());
        info!(session_id = %session_id, user_id = %user_id, "Session created");
        Ok(session)
    }

    /// Remove a session and tear down everything it owns
    ///
    /// The entry leaves the map before teardown starts, so no lookup can
    /// observe a half-torn-down session. Teardown failures are logged and
    /// never reported. Fires the id's [`SessionRegistry::ended`] token even
    /// when no session existed. Returns whether a session was removed.
    pub async fn remove(&self, session_id: &str) -> bool {
        let entry = self.sessions.write().await.remove(session_id);
        if let Some(ended) = self.endings.lock().remove(session_id) {
            ended.cancel();
        }

        let gate = {
            let mut gates = self.gates.lock();
            match gates.get(session_id).map(|gate| gate.is_idle()) {
                Some(true) => gates.remove(session_id),
                Some(false) => gates.get(session_id).cloned(),
                None => None,
            }
        };
        if let Some(gate) = gate {
            if gate.abort_attempt() {
                debug!(session_id = %session_id, "Aborted in-flight connection attempt");
            }
        }

        let Some(session) = entry else {
            return false;
        };

        let teardown = session.lock().await.begin_teardown();
        teardown.run(self.policy.cancel_ack_timeout()).await;
        info!(session_id = %session_id, "Session removed");
        true
    }

    /// Run `f` against a live session
    pub async fn with_session<F, R>(&self, session_id: &str, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let session = self.get(session_id).await.ok_or(SessionError::NoSession)?;
        let mut guard = session.lock().await;
        guard.ensure_live()?;
        Ok(f(&mut guard))
    }

    /// Fails with `NoSession` if absent, `NoConnection` if not connected
    pub async fn require_connected(&self, session_id: &str) -> Result<Connected, SessionError> {
        let session = self.get(session_id).await.ok_or(SessionError::NoSession)?;
        let driver = {
            let guard = session.lock().await;
            guard.require_connection()?.driver.clone()
        };
        Ok(Connected { session, driver })
    }

    /// Gate for connection creation on `session_id`
    pub fn connect_gate(&self, session_id: &str) -> Arc<ConnectGate> {
        self.gates
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Token that fires when `session_id` is next removed
    ///
    /// Holders outlive the session entry itself, e.g. an event channel opened
    /// before the first connection was created.
    pub fn ended(&self, session_id: &str) -> Arc<CancellationToken> {
        let mut endings = self.endings.lock();
        endings.retain(|_, token| Arc::strong_count(token) > 1);
        endings
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(CancellationToken::new()))
            .clone()
    }

    /// Summaries of every session
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<SharedSession> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let guard = session.lock().await;
            if !guard.is_removed() {
                infos.push(guard.info());
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove every session older than `max_age`, returning their ids
    pub async fn reap_expired(&self, max_age: Duration) -> Vec<SessionId> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };

        let expired: Vec<SessionId> = self
            .list()
            .await
            .into_iter()
            .filter(|info| info.created_at < cutoff)
            .map(|info| info.id)
            .collect();

        for session_id in &expired {
            self.remove(session_id).await;
        }
        expired
    }

    /// Record a rejected token attributable to `session_id`
    ///
    /// Removes the session on the second consecutive rejection and returns
    /// whether it did.
    pub async fn record_auth_rejection(&self, session_id: &str) -> bool {
        let count = {
            let mut rejections = self.rejections.lock();
            let count = rejections.entry(session_id.to_string()).or_insert(0);
            *count += 1;
            if *count >= REJECTIONS_BEFORE_REMOVAL {
                rejections.remove(session_id);
                REJECTIONS_BEFORE_REMOVAL
            } else {
                *count
            }
        };

        if count >= REJECTIONS_BEFORE_REMOVAL {
            info!(session_id = %session_id, "Removing session after repeated token rejection");
            return self.remove(session_id).await;
        }
        false
    }

    /// Reset the rejection count after a successful verification
    pub fn record_auth_success(&self, session_id: &str) {
        self.rejections.lock().remove(session_id);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}
