//! Driver capability traits
//!
//! The session layer only ever talks to these traits. Each driver decides how
//! it opens, probes, cancels and reserves; the engine never sees the
//! mechanics.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::DriverError;

use super::types::*;

/// Stops a running statement
///
/// `cancel` only signals; the statement's own future resolves with
/// [`DriverError::Interrupted`] (or its natural result if it was already
/// finishing) once the driver has stopped it.
pub trait QueryCanceler: Send + Sync {
    fn cancel(&self);
}

/// A statement that has been issued and can be cancelled while it runs
pub struct RunningQuery {
    pub canceler: Arc<dyn QueryCanceler>,
    pub result: BoxFuture<'static, Result<RowSet, DriverError>>,
}

/// A connection held exclusively by one tab for transactional work
#[async_trait]
pub trait ReservedConnection: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError>;

    async fn begin(&self) -> Result<(), DriverError> {
        self.execute("BEGIN").await.map(|_| ())
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Return the connection to the driver; any open transaction is rolled back
    async fn release(&self) -> Result<(), DriverError>;
}

/// A live connection to one database
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Driver name as used in [`ConnectionConfig::connection_type`]
    fn connection_type(&self) -> &str;

    /// Open the connection and probe it with a trivial round-trip
    async fn open(&self) -> Result<(), DriverError>;

    async fn close(&self) -> Result<(), DriverError>;

    /// Run a single statement to completion
    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError>;

    /// Run a possibly multi-statement command, one result per statement
    async fn execute_command(&self, sql: &str) -> Result<Vec<RowSet>, DriverError> {
        self.execute(sql).await.map(|rows| vec![rows])
    }

    /// Issue a statement and hand back its cancel handle immediately
    fn start(&self, sql: &str) -> RunningQuery;

    /// Check out a connection for exclusive transactional use
    async fn reserve(&self) -> Result<Arc<dyn ReservedConnection>, DriverError> {
        Err(DriverError::Unsupported("Transactions".to_string()))
    }

    async fn version_string(&self) -> Result<String, DriverError>;

    fn supported_features(&self) -> SupportedFeatures;

    async fn list_databases(&self) -> Result<Vec<String>, DriverError>;

    async fn list_schemas(&self) -> Result<Vec<String>, DriverError> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, filter: &ListFilter) -> Result<Vec<TableDescriptor>, DriverError>;

    async fn list_views(&self, filter: &ListFilter) -> Result<Vec<TableDescriptor>, DriverError>;

    async fn list_materialized_views(
        &self,
        _filter: &ListFilter,
    ) -> Result<Vec<TableDescriptor>, DriverError> {
        Ok(Vec::new())
    }

    async fn list_routines(
        &self,
        _filter: &ListFilter,
    ) -> Result<Vec<RoutineDescriptor>, DriverError> {
        Ok(Vec::new())
    }

    async fn list_table_columns(
        &self,
        table: &TableRef,
    ) -> Result<Vec<ColumnDescriptor>, DriverError>;

    async fn list_table_indexes(
        &self,
        table: &TableRef,
    ) -> Result<Vec<IndexDescriptor>, DriverError> {
        let _ = table;
        Err(DriverError::Unsupported("Index listing".to_string()))
    }

    async fn list_table_triggers(
        &self,
        table: &TableRef,
    ) -> Result<Vec<TriggerDescriptor>, DriverError> {
        let _ = table;
        Err(DriverError::Unsupported("Trigger listing".to_string()))
    }

    async fn get_table_keys(&self, table: &TableRef) -> Result<Vec<KeyDescriptor>, DriverError> {
        let _ = table;
        Err(DriverError::Unsupported("Key listing".to_string()))
    }

    async fn get_table_properties(&self, table: &TableRef) -> Result<TableProperties, DriverError> {
        let _ = table;
        Err(DriverError::Unsupported("Table properties".to_string()))
    }

    async fn get_table_create_script(&self, table: &TableRef) -> Result<String, DriverError> {
        let _ = table;
        Err(DriverError::Unsupported("Create script".to_string()))
    }

    async fn select_top(&self, request: &TablePageRequest) -> Result<TablePage, DriverError>;

    async fn create_table(&self, spec: &TableSpec) -> Result<(), DriverError> {
        let _ = spec;
        Err(DriverError::Unsupported("Create table".to_string()))
    }

    async fn alter_table(&self, table: &TableRef, changes: &AlterSpec) -> Result<(), DriverError> {
        let _ = (table, changes);
        Err(DriverError::Unsupported("Alter table".to_string()))
    }

    async fn drop_table(&self, table: &TableRef) -> Result<(), DriverError> {
        let _ = table;
        Err(DriverError::Unsupported("Drop table".to_string()))
    }
}

/// Builds drivers from connection configs
///
/// Building never touches the network or disk; that happens in
/// [`DatabaseDriver::open`].
pub trait DriverFactory: Send + Sync {
    fn build(&self, config: &ConnectionConfig) -> Result<Arc<dyn DatabaseDriver>, DriverError>;
}
