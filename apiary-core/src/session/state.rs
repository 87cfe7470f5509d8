//! Per-session state
//!
//! A [`Session`] is only ever touched through its registry entry's lock.
//! Everything that must be torn down together (connection, operations,
//! reservations) lives here so one lock acquisition can drain it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::driver::{ConnectionConfig, DatabaseDriver, ReservedConnection};
use crate::error::SessionError;
use crate::query::{CancelableOperation, OperationId, OperationKind};

/// Session identifier; derived from the user id of the caller's identity
pub type SessionId = String;

/// Client tab identifier
pub type TabId = u64;

/// The session's single live database connection
#[derive(Clone)]
pub struct ActiveConnection {
    pub driver: Arc<dyn DatabaseDriver>,
    pub config: ConnectionConfig,
    pub connected_at: DateTime<Utc>,
}

impl ActiveConnection {
    pub fn new(driver: Arc<dyn DatabaseDriver>, config: ConnectionConfig) -> Self {
        Self {
            driver,
            config,
            connected_at: Utc::now(),
        }
    }

    /// Database the connection was opened against
    pub fn database(&self) -> Option<&str> {
        self.config.database.as_deref()
    }
}

/// A tab's exclusive transactional connection plus its idle timer
///
/// The timer handle is owned here so that replacing or dropping the
/// reservation always stops the previous timer.
pub struct Reservation {
    pub connection: Arc<dyn ReservedConnection>,
    pub reserved_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Reservation {
    pub fn new(connection: Arc<dyn ReservedConnection>) -> Self {
        let now = Utc::now();
        Self {
            connection,
            reserved_at: now,
            last_activity: now,
            generation: 0,
            timer: None,
        }
    }

    /// Generation of the currently armed timer
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the idle timer; the previous one is aborted first
    pub fn rearm(&mut self, generation: u64, timer: JoinHandle<()>) {
        if let Some(old) = self.timer.take() {
            old.abort();
        }
        self.generation = generation;
        self.last_activity = Utc::now();
        self.timer = Some(timer);
    }

    /// Forget the timer without aborting it (used by the timer task itself)
    pub fn detach_timer(&mut self) {
        self.timer = None;
    }

    pub fn has_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Summary of a session for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub active_queries: usize,
    pub reservations: usize,
}

/// State of one user's session
pub struct Session {
    id: SessionId,
    user_id: String,
    created_at: DateTime<Utc>,
    connection: Option<ActiveConnection>,
    active_queries: HashMap<OperationId, Arc<CancelableOperation>>,
    reservations: HashMap<TabId, Reservation>,
    next_operation: u64,
    next_generation: u64,
    removed: bool,
}

/// Everything drained out of a session for teardown outside its lock
pub struct Teardown {
    pub session_id: SessionId,
    pub connection: Option<ActiveConnection>,
    pub operations: Vec<Arc<CancelableOperation>>,
    pub reservations: Vec<(TabId, Reservation)>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            connection: None,
            active_queries: HashMap::new(),
            reservations: HashMap::new(),
            next_operation: 1,
            next_generation: 1,
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the session has been taken out of the registry
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Fail with `NoSession` once the session has been removed
    pub fn ensure_live(&self) -> Result<(), SessionError> {
        if self.removed {
            Err(SessionError::NoSession)
        } else {
            Ok(())
        }
    }

    // ==================== Connection ====================

    pub fn connection(&self) -> Option<&ActiveConnection> {
        self.connection.as_ref()
    }

    /// The live connection, or `NoConnection`
    pub fn require_connection(&self) -> Result<&ActiveConnection, SessionError> {
        self.ensure_live()?;
        self.connection.as_ref().ok_or(SessionError::NoConnection)
    }

    /// Install a connection, returning the one it replaces
    pub fn install_connection(&mut self, connection: ActiveConnection) -> Option<ActiveConnection> {
        self.connection.replace(connection)
    }

    pub fn take_connection(&mut self) -> Option<ActiveConnection> {
        self.connection.take()
    }

    // ==================== Operations ====================

    /// Allocate an id and register an operation in one step
    pub fn register_operation(
        &mut self,
        kind: OperationKind,
        correlation_id: &str,
    ) -> Result<Arc<CancelableOperation>, SessionError> {
        self.ensure_live()?;
        let id = OperationId(self.next_operation);
        self.next_operation += 1;
        let op = Arc::new(CancelableOperation::new(
            id,
            kind,
            correlation_id,
            self.id.clone(),
        ));
        self.active_queries.insert(id, op.clone());
        Ok(op)
    }

    pub fn operation(&self, id: OperationId) -> Option<Arc<CancelableOperation>> {
        self.active_queries.get(&id).cloned()
    }

    pub fn deregister_operation(&mut self, id: OperationId) -> Option<Arc<CancelableOperation>> {
        self.active_queries.remove(&id)
    }

    /// Whether `id` was handed out by this session
    pub fn was_issued(&self, id: OperationId) -> bool {
        id.0 > 0 && id.0 < self.next_operation
    }

    pub fn active_operation_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<_> = self.active_queries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Take every active operation out of the session
    pub fn drain_operations(&mut self) -> Vec<Arc<CancelableOperation>> {
        self.active_queries.drain().map(|(_, op)| op).collect()
    }

    // ==================== Reservations ====================

    pub fn reservation(&self, tab_id: TabId) -> Option<&Reservation> {
        self.reservations.get(&tab_id)
    }

    pub fn reservation_mut(&mut self, tab_id: TabId) -> Option<&mut Reservation> {
        self.reservations.get_mut(&tab_id)
    }

    /// The tab's reservation, or `NoReservation`
    pub fn require_reservation(&mut self, tab_id: TabId) -> Result<&mut Reservation, SessionError> {
        self.ensure_live()?;
        self.reservations
            .get_mut(&tab_id)
            .ok_or(SessionError::NoReservation(tab_id))
    }

    pub fn has_reservation(&self, tab_id: TabId) -> bool {
        self.reservations.contains_key(&tab_id)
    }

    /// Insert a reservation; fails if the tab already holds one
    pub fn insert_reservation(
        &mut self,
        tab_id: TabId,
        reservation: Reservation,
    ) -> Result<&mut Reservation, SessionError> {
        self.ensure_live()?;
        if self.reservations.contains_key(&tab_id) {
            return Err(SessionError::AlreadyReserved(tab_id));
        }
        Ok(self.reservations.entry(tab_id).or_insert(reservation))
    }

    pub fn remove_reservation(&mut self, tab_id: TabId) -> Option<Reservation> {
        self.reservations.remove(&tab_id)
    }

    pub fn reserved_tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<_> = self.reservations.keys().copied().collect();
        tabs.sort();
        tabs
    }

    pub fn drain_reservations(&mut self) -> Vec<(TabId, Reservation)> {
        self.reservations.drain().collect()
    }

    /// Next timer generation for reservation timers
    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    // ==================== Teardown ====================

    /// Mark the session removed and drain everything it owns
    pub fn begin_teardown(&mut self) -> Teardown {
        self.removed = true;
        Teardown {
            session_id: self.id.clone(),
            connection: self.connection.take(),
            operations: self.drain_operations(),
            reservations: self.drain_reservations(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            connected: self.connection.is_some(),
            connection_type: self
                .connection
                .as_ref()
                .map(|c| c.config.connection_type.clone()),
            database: self
                .connection
                .as_ref()
                .and_then(|c| c.database().map(str::to_string)),
            active_queries: self.active_queries.len(),
            reservations: self.reservations.len(),
        }
    }
}

impl Teardown {
    /// Cancel operations, release reservations and close the connection
    ///
    /// Never fails: each failing sub-step is logged and the rest still run.
    pub async fn run(self, ack_timeout: std::time::Duration) {
        let session_id = self.session_id;

        for op in &self.operations {
            op.cancel();
        }
        for op in &self.operations {
            if !op.wait_finished(ack_timeout).await {
                warn!(session_id = %session_id, operation_id = %op.id, "Operation did not acknowledge cancel");
            }
        }

        for (tab_id, reservation) in self.reservations {
            if let Err(e) = reservation.connection.release().await {
                warn!(session_id = %session_id, tab_id, error = %e, "Failed to release reservation");
            }
        }

        if let Some(connection) = self.connection {
            if let Err(e) = connection.driver.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close connection");
            }
        }
    }
}
