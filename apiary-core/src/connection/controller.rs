//! ConnectionController creates, tests and tears down session connections
//!
//! Creation for one session id is serialized behind the registry's connect
//! gate. The old connection is always closed before the new one opens, so a
//! session never holds two live connections.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::driver::{ConnectionConfig, DatabaseDriver, DriverFactory};
use crate::error::SessionError;
use crate::session::{ActiveConnection, SessionInfo, SessionRegistry, SharedSession, Teardown};

/// Trivial statement run by [`ConnectionController::connect`]
pub const PROBE_STATEMENT: &str = "SELECT 1";

pub struct ConnectionController {
    registry: Arc<SessionRegistry>,
    drivers: Arc<dyn DriverFactory>,
}

impl ConnectionController {
    pub fn new(registry: Arc<SessionRegistry>, drivers: Arc<dyn DriverFactory>) -> Self {
        Self { registry, drivers }
    }

    /// Open a connection from `config` and install it into the caller's session
    ///
    /// Creates the session on first use. Any prior connection (with its
    /// reservations and running operations) is torn down first.
    pub async fn create(
        &self,
        session_id: &str,
        config: Option<&ConnectionConfig>,
        identity: Option<&Identity>,
    ) -> Result<SessionInfo, SessionError> {
        let identity = require_identity(identity)?;
        let config = require_config(config)?;
        self.replace_connection(session_id, &identity.user_id, config.clone())
            .await
    }

    /// Open, probe and close a connection without touching any session
    pub async fn test(
        &self,
        config: Option<&ConnectionConfig>,
        identity: Option<&Identity>,
    ) -> Result<(), SessionError> {
        require_identity(identity)?;
        let config = require_config(config)?;
        let driver = self.drivers.build(config).map_err(SessionError::connection)?;

        let opened = driver.open().await.map_err(SessionError::connection);
        if let Err(e) = driver.close().await {
            warn!(connection_type = %config.connection_type, error = %e, "Failed to close test connection");
        }
        debug!(connection_type = %config.connection_type, ok = opened.is_ok(), "Tested connection");
        opened
    }

    /// Check that the session holds a connection that still answers
    ///
    /// A failed round-trip reports `ConnectionError` and leaves the
    /// connection installed.
    pub async fn connect(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        let connected = self.registry.require_connected(session_id).await?;
        connected
            .driver
            .execute(PROBE_STATEMENT)
            .await
            .map_err(SessionError::connection)?;
        self.registry.with_session(session_id, |s| s.info()).await
    }

    /// Close the session's connection; a no-op when there is none
    ///
    /// Releases the session's reservations and cancels its running operations
    /// too, since they lived on the connection being closed.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), SessionError> {
        let Some(session) = self.registry.get(session_id).await else {
            return Ok(());
        };
        let gate = self.registry.connect_gate(session_id);
        let _entry = gate.enter().await;
        let Some(teardown) = detach(&session).await else {
            return Ok(());
        };
        teardown.run(self.registry.policy().cancel_ack_timeout()).await;
        info!(session_id = %session_id, "Disconnected");
        Ok(())
    }

    /// Reconnect the session against another database on the same server
    pub async fn change_database(
        &self,
        session_id: &str,
        database: &str,
    ) -> Result<SessionInfo, SessionError> {
        let (user_id, config) = self
            .registry
            .with_session(session_id, |s| {
                let config = s.require_connection()?.config.clone();
                Ok::<_, SessionError>((s.user_id().to_string(), config))
            })
            .await??;
        self.replace_connection(session_id, &user_id, config.with_database(database))
            .await
    }

    async fn replace_connection(
        &self,
        session_id: &str,
        user_id: &str,
        config: ConnectionConfig,
    ) -> Result<SessionInfo, SessionError> {
        let gate = self.registry.connect_gate(session_id);
        let _entry = gate.enter().await;

        let existing = self.registry.get(session_id).await;
        if let Some(session) = &existing {
            if let Some(teardown) = detach(session).await {
                debug!(session_id = %session_id, "Closing previous connection");
                teardown.run(self.registry.policy().cancel_ack_timeout()).await;
            }
        }

        let token = gate.begin_attempt();
        let driver = match self.drivers.build(&config) {
            Ok(driver) => driver,
            Err(e) => {
                gate.end_attempt();
                return Err(SessionError::connection(e));
            }
        };
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::AttemptAborted),
            result = driver.open() => result.map_err(SessionError::connection),
        };
        gate.end_attempt();

        if let Err(e) = opened {
            if e == SessionError::AttemptAborted {
                close_quietly(session_id, driver.as_ref()).await;
            }
            warn!(session_id = %session_id, connection_type = %config.connection_type, error = %e, "Connection failed");
            return Err(e);
        }

        let session = match self.live_session(existing).await {
            Some(session) => session,
            None => match self.registry.create(session_id, user_id).await {
                Ok(session) => session,
                Err(e) => {
                    close_quietly(session_id, driver.as_ref()).await;
                    return Err(e);
                }
            },
        };

        let connection_type = config.connection_type.clone();
        let (displaced, info) = {
            let mut guard = session.lock().await;
            if guard.is_removed() {
                drop(guard);
                close_quietly(session_id, driver.as_ref()).await;
                return Err(SessionError::AttemptAborted);
            }
            let displaced = guard.install_connection(ActiveConnection::new(driver, config));
            (displaced, guard.info())
        };
        if let Some(old) = displaced {
            close_quietly(session_id, old.driver.as_ref()).await;
        }

        info!(session_id = %session_id, connection_type = %connection_type, "Connection established");
        Ok(info)
    }

    async fn live_session(&self, existing: Option<SharedSession>) -> Option<SharedSession> {
        let session = existing?;
        let removed = session.lock().await.is_removed();
        (!removed).then_some(session)
    }
}

fn require_identity(identity: Option<&Identity>) -> Result<&Identity, SessionError> {
    identity
        .filter(|i| !i.username.trim().is_empty() && !i.user_id.is_empty())
        .ok_or(SessionError::MissingIdentity)
}

fn require_config(config: Option<&ConnectionConfig>) -> Result<&ConnectionConfig, SessionError> {
    config
        .filter(|c| !c.is_empty())
        .ok_or(SessionError::MissingConfig)
}

/// Take the connection and everything that depends on it out of a session
async fn detach(session: &SharedSession) -> Option<Teardown> {
    let mut guard = session.lock().await;
    if guard.is_removed() {
        return None;
    }
    let connection = guard.take_connection()?;
    Some(Teardown {
        session_id: guard.id().to_string(),
        connection: Some(connection),
        operations: guard.drain_operations(),
        reservations: guard.drain_reservations(),
    })
}

async fn close_quietly(session_id: &str, driver: &dyn DatabaseDriver) {
    if let Err(e) = driver.close().await {
        warn!(session_id = %session_id, error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::{DriverRegistry, MemoryDriverFactory};
    use crate::query::{CancelableOperation, OperationKind};
    use crate::session::{Reservation, SessionPolicy};

    fn admin() -> Identity {
        Identity::new("1", "admin")
    }

    fn setup() -> (ConnectionController, Arc<SessionRegistry>, MemoryDriverFactory) {
        let registry = Arc::new(SessionRegistry::new(SessionPolicy {
            cancel_ack_timeout_ms: 50,
            ..SessionPolicy::default()
        }));
        let factory = MemoryDriverFactory::new();
        let drivers = DriverRegistry::new().register("memory", factory.clone());
        let controller = ConnectionController::new(registry.clone(), Arc::new(drivers));
        (controller, registry, factory)
    }

    fn memory_config() -> ConnectionConfig {
        ConnectionConfig::new("memory", "main")
    }

    // ==================== Create Tests ====================

    #[tokio::test]
    async fn create_installs_connection_and_session() {
        let (controller, registry, factory) = setup();
        let info = controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();

        assert!(info.connected);
        assert_eq!(info.user_id, "1");
        assert!(registry.require_connected("1").await.is_ok());
        assert_eq!(factory.live_connections(), 1);
    }

    #[tokio::test]
    async fn create_validates_inputs() {
        let (controller, _, _) = setup();

        let err = controller.create("1", None, Some(&admin())).await.unwrap_err();
        assert_eq!(err, SessionError::MissingConfig);

        let err = controller
            .create("1", Some(&ConnectionConfig::default()), Some(&admin()))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::MissingConfig);

        let err = controller
            .create("1", Some(&memory_config()), None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::MissingIdentity);
    }

    #[tokio::test]
    async fn create_reports_driver_message_verbatim() {
        let (controller, registry, factory) = setup();
        factory.fail_open(Some("password authentication failed"));

        let err = controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "password authentication failed");
        assert!(registry.get("1").await.is_none());
    }

    #[tokio::test]
    async fn unknown_connection_type_is_a_connection_error() {
        let (controller, _, _) = setup();
        let err = controller
            .create("1", Some(&ConnectionConfig::new("oracle", "x")), Some(&admin()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::codes::CONNECTION_ERROR);
    }

    #[tokio::test]
    async fn recreate_closes_previous_connection_first() {
        let (controller, _, factory) = setup();
        for _ in 0..3 {
            controller
                .create("1", Some(&memory_config()), Some(&admin()))
                .await
                .unwrap();
        }

        assert_eq!(factory.live_connections(), 1);
        assert_eq!(factory.max_live_connections(), 1);
        assert_eq!(factory.closed(), 2);
    }

    #[tokio::test]
    async fn concurrent_creates_never_hold_two_connections() {
        let (controller, _, factory) = setup();
        let controller = Arc::new(controller);
        factory.set_open_latency(Duration::from_millis(10));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .create("1", Some(&memory_config()), Some(&admin()))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(factory.live_connections(), 1);
        assert_eq!(factory.max_live_connections(), 1);
    }

    #[tokio::test]
    async fn removal_aborts_slow_connection_attempt() {
        let (controller, registry, factory) = setup();
        factory.set_open_latency(Duration::from_secs(30));
        let controller = Arc::new(controller);

        let attempt = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .create("1", Some(&memory_config()), Some(&admin()))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.remove("1").await;

        let err = attempt.await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::AttemptAborted);
        assert_eq!(factory.live_connections(), 0);
    }

    // ==================== Test Connection Tests ====================

    #[tokio::test]
    async fn test_always_closes() {
        let (controller, registry, factory) = setup();
        controller
            .test(Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();
        assert_eq!(factory.live_connections(), 0);
        assert_eq!(factory.opened(), 1);
        assert!(registry.get("1").await.is_none());

        factory.fail_open(Some("refused"));
        let err = controller
            .test(Some(&memory_config()), Some(&admin()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "refused");
        assert_eq!(factory.live_connections(), 0);
    }

    // ==================== Disconnect Tests ====================

    #[tokio::test]
    async fn disconnect_leaves_session_without_connection() {
        let (controller, registry, factory) = setup();
        controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();

        controller.disconnect("1").await.unwrap();
        assert_eq!(
            registry.require_connected("1").await.err(),
            Some(SessionError::NoConnection)
        );
        assert_eq!(factory.live_connections(), 0);

        // Repeating is a no-op
        controller.disconnect("1").await.unwrap();
        controller.disconnect("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_releases_reservations_and_operations() {
        let (controller, registry, _) = setup();
        controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();
        let session = registry.get("1").await.unwrap();
        let op = {
            let mut guard = session.lock().await;
            let driver = guard.connection().unwrap().driver.clone();
            guard
                .insert_reservation(4, Reservation::new(driver.reserve().await.unwrap()))
                .unwrap();
            guard.register_operation(OperationKind::Query, "c").unwrap()
        };

        controller.disconnect("1").await.unwrap();
        assert!(op.is_cancelled());
        let guard = session.lock().await;
        assert!(guard.reserved_tabs().is_empty());
        assert!(guard.active_operation_ids().is_empty());
    }

    #[tokio::test]
    async fn interleaved_create_and_disconnect_keep_one_live_connection() {
        let (controller, _, factory) = setup();
        let controller = Arc::new(controller);
        factory.set_open_latency(Duration::from_millis(5));

        let mut handles = Vec::new();
        for i in 0..16 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    controller
                        .create("1", Some(&memory_config()), Some(&admin()))
                        .await
                        .map(|_| ())
                } else {
                    controller.disconnect("1").await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(factory.max_live_connections() <= 1);
        assert!(factory.live_connections() <= 1);
    }

    #[tokio::test]
    async fn failed_close_still_drains_operations_and_reservations() {
        let (controller, registry, factory) = setup();

        async fn load(registry: &SessionRegistry) -> (SharedSession, Vec<Arc<CancelableOperation>>) {
            let session = registry.get("1").await.unwrap();
            let ops = {
                let mut guard = session.lock().await;
                let driver = guard.connection().unwrap().driver.clone();
                for tab in [1, 2] {
                    guard
                        .insert_reservation(tab, Reservation::new(driver.reserve().await.unwrap()))
                        .unwrap();
                }
                vec![
                    guard.register_operation(OperationKind::Query, "a").unwrap(),
                    guard.register_operation(OperationKind::Query, "b").unwrap(),
                ]
            };
            (session, ops)
        }

        // Disconnect path
        controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();
        let (session, ops) = load(&registry).await;
        factory.fail_close(true);

        controller.disconnect("1").await.unwrap();
        assert!(ops.iter().all(|op| op.is_cancelled()));
        {
            let guard = session.lock().await;
            assert!(guard.reserved_tabs().is_empty());
            assert!(guard.active_operation_ids().is_empty());
            assert!(guard.connection().is_none());
        }

        // Removal path
        factory.fail_close(false);
        controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();
        let (session, ops) = load(&registry).await;
        factory.fail_close(true);

        assert!(registry.remove("1").await);
        assert!(ops.iter().all(|op| op.is_cancelled()));
        assert!(registry.get("1").await.is_none());
        let guard = session.lock().await;
        assert!(guard.reserved_tabs().is_empty());
        assert!(guard.active_operation_ids().is_empty());
    }

    // ==================== Connect / Change Database Tests ====================

    #[tokio::test]
    async fn connect_checks_preconditions() {
        let (controller, registry, _) = setup();
        assert_eq!(controller.connect("1").await.err(), Some(SessionError::NoSession));

        registry.create("1", "1").await.unwrap();
        assert_eq!(
            controller.connect("1").await.err(),
            Some(SessionError::NoConnection)
        );
    }

    #[tokio::test]
    async fn connect_round_trips_on_the_connection() {
        let (controller, registry, factory) = setup();
        controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();

        let info = controller.connect("1").await.unwrap();
        assert!(info.connected);
        assert_eq!(factory.statements(), vec![PROBE_STATEMENT.to_string()]);

        factory.fail_statements_containing(PROBE_STATEMENT);
        let err = controller.connect("1").await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::CONNECTION_ERROR);
        assert!(registry.require_connected("1").await.is_ok());
    }

    #[tokio::test]
    async fn change_database_rebuilds_connection() {
        let (controller, _, factory) = setup();
        controller
            .create("1", Some(&memory_config()), Some(&admin()))
            .await
            .unwrap();

        let info = controller.change_database("1", "archive").await.unwrap();
        assert_eq!(info.database.as_deref(), Some("archive"));
        assert_eq!(factory.live_connections(), 1);
    }
}
