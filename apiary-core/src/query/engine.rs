//! QueryEngine runs statements against a session's connection
//!
//! Immediate statements run to completion and return their rows. Cancelable
//! statements are registered in the session first, then run on their own task
//! and report through the event bus. Transaction reservations give a tab its
//! own connection, guarded by an idle timer that is re-armed under the session
//! lock on every statement run through it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{DatabaseDriver, ReservedConnection, RowSet};
use crate::error::{DriverError, SessionError};
use crate::events::{EventBus, SessionEvent};
use crate::session::{Reservation, Session, SessionRegistry, TabId};

use super::operation::{CancelOutcome, CancelableOperation, OperationId, OperationKind};

/// Which transaction statement to run on a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStep {
    Begin,
    Commit,
    Rollback,
}

impl TransactionStep {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Executes statements and manages cancelable operations and reservations
#[derive(Clone)]
pub struct QueryEngine {
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventBus>,
    transaction_timeout: Duration,
    cancel_ack_timeout: Duration,
}

impl QueryEngine {
    pub fn new(registry: Arc<SessionRegistry>, events: Arc<dyn EventBus>) -> Self {
        let transaction_timeout = registry.policy().transaction_timeout();
        let cancel_ack_timeout = registry.policy().cancel_ack_timeout();
        Self {
            registry,
            events,
            transaction_timeout,
            cancel_ack_timeout,
        }
    }

    /// Override the reservation idle timeout
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    /// The driver of a connected session, for introspection calls
    pub async fn driver(&self, session_id: &str) -> Result<Arc<dyn DatabaseDriver>, SessionError> {
        Ok(self.registry.require_connected(session_id).await?.driver)
    }

    // ==================== Immediate Statements ====================

    /// Run one statement to completion
    ///
    /// With `tab_id` the statement runs on that tab's reserved connection and
    /// resets its idle timer.
    pub async fn execute_immediate(
        &self,
        session_id: &str,
        sql: &str,
        tab_id: Option<TabId>,
    ) -> Result<RowSet, SessionError> {
        match tab_id {
            Some(tab_id) => {
                let connection = self.touch_reservation(session_id, tab_id).await?;
                connection.execute(sql).await.map_err(SessionError::query)
            }
            None => {
                let connected = self.registry.require_connected(session_id).await?;
                connected
                    .driver
                    .execute(sql)
                    .await
                    .map_err(SessionError::query)
            }
        }
    }

    /// Run a possibly multi-statement command, one result per statement
    ///
    /// The command is a registered operation while it runs, so disconnect and
    /// session removal interrupt it.
    pub async fn execute_command(
        &self,
        session_id: &str,
        sql: &str,
    ) -> Result<Vec<RowSet>, SessionError> {
        let connected = self.registry.require_connected(session_id).await?;
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let op = connected
            .session
            .lock()
            .await
            .register_operation(OperationKind::Command, &correlation_id)?;

        let outcome = tokio::select! {
            biased;
            _ = op.cancelled() => None,
            result = connected.driver.execute_command(sql) => Some(result),
        };
        op.settle();
        op.mark_finished();
        connected.session.lock().await.deregister_operation(op.id);

        match outcome {
            Some(result) => result.map_err(SessionError::query),
            None => {
                debug!(session_id = %session_id, operation_id = %op.id, "Command interrupted");
                Err(SessionError::query(DriverError::Interrupted))
            }
        }
    }

    // ==================== Cancelable Statements ====================

    /// Register and issue a cancelable statement
    ///
    /// The operation is in the session before the statement is issued, so a
    /// cancel for the returned id can never miss it. Progress and the single
    /// terminal event are published under `correlation_id`.
    pub async fn start_cancelable(
        &self,
        session_id: &str,
        sql: &str,
        correlation_id: &str,
        tab_id: Option<TabId>,
    ) -> Result<OperationId, SessionError> {
        let session = self.registry.get(session_id).await.ok_or(SessionError::NoSession)?;

        let (op, work) = {
            let mut guard = session.lock().await;
            let work = match tab_id {
                Some(tab_id) => {
                    let connection = self.rearm_locked(&session, &mut guard, tab_id)?;
                    Work::Reserved(connection)
                }
                None => Work::Driver(guard.require_connection()?.driver.clone()),
            };
            let op = guard.register_operation(OperationKind::Query, correlation_id)?;
            (op, work)
        };

        let id = op.id;
        debug!(session_id = %session_id, operation_id = %id, "Starting cancelable statement");
        tokio::spawn(drive_operation(
            self.events.clone(),
            Arc::downgrade(&session),
            op,
            work,
            sql.to_string(),
        ));
        Ok(id)
    }

    /// Cancel an operation and wait for it to acknowledge
    ///
    /// Cancelling an id that already finished is a success; so is cancelling
    /// twice. Ids the session never issued fail with `NoSuchOperation`.
    pub async fn cancel(
        &self,
        session_id: &str,
        operation_id: OperationId,
    ) -> Result<CancelOutcome, SessionError> {
        let session = self.registry.get(session_id).await.ok_or(SessionError::NoSession)?;
        let op = {
            let guard = session.lock().await;
            guard.ensure_live()?;
            match guard.operation(operation_id) {
                Some(op) => op,
                None if guard.was_issued(operation_id) => return Ok(CancelOutcome::AlreadyFinished),
                None => return Err(SessionError::NoSuchOperation(operation_id)),
            }
        };

        let outcome = op.cancel();
        if !op.wait_finished(self.cancel_ack_timeout).await {
            warn!(session_id = %session_id, operation_id = %operation_id, "Operation did not acknowledge cancel");
        }
        session.lock().await.deregister_operation(operation_id);
        info!(session_id = %session_id, operation_id = %operation_id, ?outcome, "Cancel handled");
        Ok(outcome)
    }

    // ==================== Transaction Reservations ====================

    /// Check out a connection for `tab_id` and arm its idle timer
    ///
    /// The session lock is held across the driver call, so of two concurrent
    /// reserves for one tab the second always fails with `AlreadyReserved`.
    pub async fn reserve(&self, session_id: &str, tab_id: TabId) -> Result<(), SessionError> {
        let session = self.registry.get(session_id).await.ok_or(SessionError::NoSession)?;
        let mut guard = session.lock().await;
        let driver = guard.require_connection()?.driver.clone();
        if guard.has_reservation(tab_id) {
            return Err(SessionError::AlreadyReserved(tab_id));
        }

        let connection = driver.reserve().await.map_err(SessionError::query)?;
        let generation = guard.next_generation();
        let timer = self.spawn_timer(&session, tab_id, generation);
        guard
            .insert_reservation(tab_id, Reservation::new(connection))?
            .rearm(generation, timer);
        info!(session_id = %session_id, tab_id, "Reserved connection");
        Ok(())
    }

    /// Release a tab's reservation; an open transaction is rolled back
    pub async fn release(&self, session_id: &str, tab_id: TabId) -> Result<(), SessionError> {
        let reservation = self
            .registry
            .with_session(session_id, |s| s.remove_reservation(tab_id))
            .await?
            .ok_or(SessionError::NoReservation(tab_id))?;

        let result = reservation
            .connection
            .release()
            .await
            .map_err(SessionError::query);
        info!(session_id = %session_id, tab_id, "Released reservation");
        result
    }

    /// Run BEGIN, COMMIT or ROLLBACK on a tab's reservation
    ///
    /// Fails with `NoReservation` if the tab holds none, including when the
    /// idle timer won the race.
    pub async fn transaction(
        &self,
        session_id: &str,
        tab_id: TabId,
        step: TransactionStep,
    ) -> Result<(), SessionError> {
        let connection = self.touch_reservation(session_id, tab_id).await?;
        debug!(session_id = %session_id, tab_id, step = step.as_str(), "Transaction step");
        let result = match step {
            TransactionStep::Begin => connection.begin().await,
            TransactionStep::Commit => connection.commit().await,
            TransactionStep::Rollback => connection.rollback().await,
        };
        result.map_err(SessionError::query)
    }

    /// Re-arm the tab's timer and hand out its connection
    async fn touch_reservation(
        &self,
        session_id: &str,
        tab_id: TabId,
    ) -> Result<Arc<dyn ReservedConnection>, SessionError> {
        let session = self.registry.get(session_id).await.ok_or(SessionError::NoSession)?;
        let mut guard = session.lock().await;
        self.rearm_locked(&session, &mut guard, tab_id)
    }

    fn rearm_locked(
        &self,
        session: &Arc<Mutex<Session>>,
        guard: &mut Session,
        tab_id: TabId,
    ) -> Result<Arc<dyn ReservedConnection>, SessionError> {
        // Fail before allocating a generation or spawning a timer
        guard.require_reservation(tab_id)?;
        let generation = guard.next_generation();
        let timer = self.spawn_timer(session, tab_id, generation);
        let reservation = guard.require_reservation(tab_id)?;
        reservation.rearm(generation, timer);
        Ok(reservation.connection.clone())
    }

    fn spawn_timer(
        &self,
        session: &Arc<Mutex<Session>>,
        tab_id: TabId,
        generation: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(expire_reservation(
            self.events.clone(),
            Arc::downgrade(session),
            tab_id,
            generation,
            self.transaction_timeout,
        ))
    }
}

enum Work {
    Driver(Arc<dyn DatabaseDriver>),
    Reserved(Arc<dyn ReservedConnection>),
}

async fn drive_operation(
    events: Arc<dyn EventBus>,
    session: Weak<Mutex<Session>>,
    op: Arc<CancelableOperation>,
    work: Work,
    sql: String,
) {
    let result: BoxFuture<'static, _> = match work {
        Work::Driver(driver) => {
            let running = driver.start(&sql);
            op.attach(running.canceler);
            running.result
        }
        // A reserved connection can only be abandoned, not interrupted
        Work::Reserved(connection) => Box::pin(async move { connection.execute(&sql).await }),
    };

    events
        .publish(
            &op.session_id,
            SessionEvent::QueryStart {
                correlation_id: op.correlation_id.clone(),
                operation_id: op.id,
            },
        )
        .await;

    let outcome = tokio::select! {
        biased;
        _ = op.cancelled() => None,
        result = result => Some(result),
    };

    let correlation_id = op.correlation_id.clone();
    let operation_id = op.id;
    if op.settle() {
        events
            .publish(
                &op.session_id,
                SessionEvent::QueryCancelled {
                    correlation_id,
                    operation_id,
                },
            )
            .await;
    } else {
        match outcome {
            Some(Ok(rows)) => {
                let row_count = rows.row_count;
                events
                    .publish(
                        &op.session_id,
                        SessionEvent::QueryData {
                            correlation_id: correlation_id.clone(),
                            operation_id,
                            result: rows,
                        },
                    )
                    .await;
                events
                    .publish(
                        &op.session_id,
                        SessionEvent::QueryComplete {
                            correlation_id,
                            operation_id,
                            row_count,
                        },
                    )
                    .await;
            }
            Some(Err(e)) => {
                let err = SessionError::query(e);
                events
                    .publish(
                        &op.session_id,
                        SessionEvent::QueryError {
                            correlation_id,
                            operation_id,
                            error: err.to_string(),
                            code: err.code().to_string(),
                            detail: err.detail().map(str::to_string),
                        },
                    )
                    .await;
            }
            // Settle saw no cancel, so the select cannot have taken that branch
            None => {}
        }
    }

    op.mark_finished();
    if let Some(session) = session.upgrade() {
        session.lock().await.deregister_operation(operation_id);
    }
}

async fn expire_reservation(
    events: Arc<dyn EventBus>,
    session: Weak<Mutex<Session>>,
    tab_id: TabId,
    generation: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    let Some(session) = session.upgrade() else {
        return;
    };

    let (session_id, reservation) = {
        let mut guard = session.lock().await;
        if guard.is_removed() {
            return;
        }
        match guard.reservation_mut(tab_id) {
            // A newer timer owns the reservation
            Some(r) if r.generation() == generation => r.detach_timer(),
            _ => return,
        }
        (guard.id().to_string(), guard.remove_reservation(tab_id))
    };
    let Some(reservation) = reservation else {
        return;
    };

    let rollback = reservation.connection.rollback().await;
    if let Err(e) = reservation.connection.release().await {
        warn!(session_id = %session_id, tab_id, error = %e, "Failed to release timed out reservation");
    }
    warn!(session_id = %session_id, tab_id, rolled_back = rollback.is_ok(), "Transaction idle timeout");

    events
        .publish(
            &session_id,
            SessionEvent::TransactionTimeout {
                tab_id,
                rolled_back: rollback.is_ok(),
                error: rollback.err().map(|e| e.to_string()),
            },
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConnectionConfig, DriverFactory, MemoryDriverFactory};
    use crate::events::{EventSeq, MemoryEventBus, SessionEventEnvelope};
    use crate::session::{ActiveConnection, SessionPolicy};
    use tokio::sync::broadcast;

    struct Harness {
        engine: QueryEngine,
        registry: Arc<SessionRegistry>,
        factory: MemoryDriverFactory,
        events: Arc<MemoryEventBus>,
    }

    async fn harness() -> Harness {
        let registry = Arc::new(SessionRegistry::new(SessionPolicy {
            cancel_ack_timeout_ms: 500,
            ..SessionPolicy::default()
        }));
        let events = Arc::new(MemoryEventBus::default());
        let factory = MemoryDriverFactory::new().with_tables(&["users"]);

        registry.create("s1", "u1").await.unwrap();
        let config = ConnectionConfig::new("memory", "db");
        let driver = factory.build(&config).unwrap();
        driver.open().await.unwrap();
        registry
            .with_session("s1", |s| s.install_connection(ActiveConnection::new(driver, config)))
            .await
            .unwrap();

        let engine = QueryEngine::new(registry.clone(), events.clone());
        Harness {
            engine,
            registry,
            factory,
            events,
        }
    }

    async fn next_terminal(
        rx: &mut broadcast::Receiver<(EventSeq, SessionEventEnvelope)>,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (_, envelope) = rx.recv().await.unwrap();
                if envelope.event.is_terminal() {
                    return envelope.event;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Every event up to and including the first terminal one
    async fn events_until_terminal(
        rx: &mut broadcast::Receiver<(EventSeq, SessionEventEnvelope)>,
    ) -> Vec<SessionEvent> {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut events = Vec::new();
            loop {
                let (_, envelope) = rx.recv().await.unwrap();
                let terminal = envelope.event.is_terminal();
                events.push(envelope.event);
                if terminal {
                    return events;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Events already delivered to `rx`
    fn drain(rx: &mut broadcast::Receiver<(EventSeq, SessionEventEnvelope)>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok((_, envelope)) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    // ==================== Immediate Tests ====================

    #[tokio::test]
    async fn execute_immediate_requires_connection() {
        let h = harness().await;
        h.registry.create("s2", "u2").await.unwrap();

        let err = h.engine.execute_immediate("s2", "SELECT 1", None).await.unwrap_err();
        assert_eq!(err, SessionError::NoConnection);

        let err = h.engine.execute_immediate("ghost", "SELECT 1", None).await.unwrap_err();
        assert_eq!(err, SessionError::NoSession);
    }

    #[tokio::test]
    async fn execute_immediate_returns_rows() {
        let h = harness().await;
        let rows = h.engine.execute_immediate("s1", "SELECT 1", None).await.unwrap();
        assert_eq!(rows.command_tag, "SELECT");
        assert_eq!(h.factory.statements(), vec!["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn execute_immediate_passes_driver_message_through() {
        let h = harness().await;
        h.factory.fail_statements_containing("broken");

        let err = h
            .engine
            .execute_immediate("s1", "SELECT broken", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Query { .. }));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn execute_command_returns_one_result_per_statement() {
        let h = harness().await;
        let results = h
            .engine
            .execute_command("s1", "SELECT 1; SELECT 2")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn removal_interrupts_running_command() {
        let h = harness().await;
        h.factory.set_latency(Duration::from_secs(30));

        let engine = h.engine.clone();
        let running =
            tokio::spawn(async move { engine.execute_command("s1", "SELECT 1; SELECT 2").await });

        let kinds = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let kinds = h
                    .registry
                    .with_session("s1", |s| {
                        s.active_operation_ids()
                            .into_iter()
                            .filter_map(|id| s.operation(id).map(|op| op.kind))
                            .collect::<Vec<_>>()
                    })
                    .await
                    .unwrap();
                if !kinds.is_empty() {
                    return kinds;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(kinds, vec![OperationKind::Command]);

        assert!(h.registry.remove("s1").await);
        let err = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.to_string(), "Statement was interrupted");
    }

    // ==================== Cancelable Tests ====================

    #[tokio::test]
    async fn cancelable_query_completes_with_events() {
        let h = harness().await;
        let mut rx = h.events.subscribe("s1");

        let id = h
            .engine
            .start_cancelable("s1", "SELECT 1", "corr-1", None)
            .await
            .unwrap();

        let events = events_until_terminal(&mut rx).await;
        match events.last() {
            Some(SessionEvent::QueryComplete {
                correlation_id,
                operation_id,
                ..
            }) => {
                assert_eq!(correlation_id, "corr-1");
                assert_eq!(*operation_id, id);
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }

        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["query:start", "query:data", "query:complete"]);
    }

    #[tokio::test]
    async fn cancel_emits_exactly_one_cancelled_event() {
        let h = harness().await;
        h.factory.set_latency(Duration::from_secs(30));
        let mut rx = h.events.subscribe("s1");

        let id = h
            .engine
            .start_cancelable("s1", "SELECT slow", "corr-2", None)
            .await
            .unwrap();

        assert_eq!(h.engine.cancel("s1", id).await.unwrap(), CancelOutcome::Cancelled);
        assert!(matches!(
            next_terminal(&mut rx).await,
            SessionEvent::QueryCancelled { .. }
        ));

        // Second cancel is a no-op success
        assert_eq!(
            h.engine.cancel("s1", id).await.unwrap(),
            CancelOutcome::AlreadyFinished
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain(&mut rx).iter().any(|e| e.is_terminal()));
        assert!(h.factory.statements().is_empty());
    }

    #[tokio::test]
    async fn cancel_after_completion_is_already_finished() {
        let h = harness().await;
        let mut rx = h.events.subscribe("s1");
        let id = h
            .engine
            .start_cancelable("s1", "SELECT 1", "corr-3", None)
            .await
            .unwrap();
        next_terminal(&mut rx).await;

        assert_eq!(
            h.engine.cancel("s1", id).await.unwrap(),
            CancelOutcome::AlreadyFinished
        );
    }

    #[tokio::test]
    async fn cancel_unknown_operation_fails() {
        let h = harness().await;
        let err = h.engine.cancel("s1", OperationId(42)).await.unwrap_err();
        assert_eq!(err, SessionError::NoSuchOperation(OperationId(42)));
    }

    #[tokio::test]
    async fn failing_cancelable_query_emits_error() {
        let h = harness().await;
        h.factory.fail_statements_containing("nope");
        let mut rx = h.events.subscribe("s1");

        h.engine
            .start_cancelable("s1", "SELECT nope", "corr-4", None)
            .await
            .unwrap();

        match next_terminal(&mut rx).await {
            SessionEvent::QueryError { code, .. } => assert_eq!(code, "QUERY_ERROR"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_operation_leaves_session() {
        let h = harness().await;
        let mut rx = h.events.subscribe("s1");
        h.engine
            .start_cancelable("s1", "SELECT 1", "corr-5", None)
            .await
            .unwrap();
        next_terminal(&mut rx).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let active = h
                    .registry
                    .with_session("s1", |s| s.active_operation_ids().len())
                    .await
                    .unwrap();
                if active == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    // ==================== Reservation Tests ====================

    #[tokio::test]
    async fn transaction_steps_require_reservation() {
        let h = harness().await;
        let err = h
            .engine
            .transaction("s1", 1, TransactionStep::Begin)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoReservation(1));

        let err = h.engine.release("s1", 1).await.unwrap_err();
        assert_eq!(err, SessionError::NoReservation(1));
    }

    #[tokio::test]
    async fn concurrent_reserve_has_one_winner() {
        let h = harness().await;
        let (a, b) = tokio::join!(h.engine.reserve("s1", 1), h.engine.reserve("s1", 1));

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| *r == Err(SessionError::AlreadyReserved(1))));
    }

    #[tokio::test]
    async fn reserve_begin_commit_release_leaves_no_timer() {
        let h = harness().await;
        let engine = h.engine.clone().with_transaction_timeout(Duration::from_millis(100));
        let mut rx = h.events.subscribe("s1");

        engine.reserve("s1", 1).await.unwrap();
        engine.transaction("s1", 1, TransactionStep::Begin).await.unwrap();
        engine
            .execute_immediate("s1", "INSERT INTO users VALUES (1)", Some(1))
            .await
            .unwrap();
        engine.transaction("s1", 1, TransactionStep::Commit).await.unwrap();
        engine.release("s1", 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let timeouts = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type() == "transaction:timeout")
            .count();
        assert_eq!(timeouts, 0);
        assert_eq!(
            h.factory.statements(),
            vec!["BEGIN", "INSERT INTO users VALUES (1)", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn idle_reservation_times_out_once() {
        let h = harness().await;
        let engine = h.engine.clone().with_transaction_timeout(Duration::from_millis(50));
        let mut rx = h.events.subscribe("s1");

        engine.reserve("s1", 7).await.unwrap();
        engine.transaction("s1", 7, TransactionStep::Begin).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let timeouts: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::TransactionTimeout {
                    tab_id,
                    rolled_back,
                    ..
                } => Some((tab_id, rolled_back)),
                _ => None,
            })
            .collect();
        assert_eq!(timeouts, vec![(7, true)]);

        // The explicit commit lost the race
        let err = engine
            .transaction("s1", 7, TransactionStep::Commit)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoReservation(7));
    }

    #[tokio::test]
    async fn activity_resets_idle_timer() {
        let h = harness().await;
        let engine = h.engine.clone().with_transaction_timeout(Duration::from_millis(150));

        engine.reserve("s1", 2).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(75)).await;
            engine
                .execute_immediate("s1", "SELECT 1", Some(2))
                .await
                .unwrap();
        }

        let reserved = h
            .registry
            .with_session("s1", |s| s.has_reservation(2))
            .await
            .unwrap();
        assert!(reserved);
        engine.release("s1", 2).await.unwrap();
    }
}
