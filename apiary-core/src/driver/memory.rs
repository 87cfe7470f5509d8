//! Scripted in-memory driver for tests
//!
//! MemoryDriverFactory hands out drivers that share one [`MemoryState`], so a
//! test can count live connections across rebuilds, inject failures and read
//! back every statement that reached a driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;

use super::traits::{DatabaseDriver, DriverFactory, QueryCanceler, ReservedConnection, RunningQuery};
use super::types::*;

/// State shared by every driver a [`MemoryDriverFactory`] builds
#[derive(Default)]
pub struct MemoryState {
    live: AtomicUsize,
    max_live: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_open: Mutex<Option<String>>,
    fail_close: AtomicBool,
    latency: Mutex<Duration>,
    open_latency: Mutex<Duration>,
    tables: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
    statements: Mutex<Vec<String>>,
}

impl MemoryState {
    fn record(&self, sql: &str) {
        self.statements.lock().push(sql.to_string());
    }

    fn check(&self, sql: &str) -> Result<(), DriverError> {
        let failing = self.failing.lock();
        match failing.iter().find(|pattern| sql.contains(pattern.as_str())) {
            Some(pattern) => Err(DriverError::Query {
                message: format!("statement matched failing pattern '{pattern}'"),
                detail: Some(sql.to_string()),
            }),
            None => Ok(()),
        }
    }

    fn rows_for(&self, sql: &str) -> RowSet {
        let mut row = Row::new();
        row.insert("statement".to_string(), Value::String(sql.to_string()));
        RowSet {
            rows: vec![row],
            columns: vec![ColumnMeta {
                name: "statement".to_string(),
                data_type: Some("text".to_string()),
            }],
            row_count: 1,
            command_tag: command_tag(sql),
        }
    }
}

/// Factory for [`MemoryDriver`]s with test hooks
#[derive(Clone, Default)]
pub struct MemoryDriverFactory {
    state: Arc<MemoryState>,
}

impl MemoryDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables reported by `list_tables`
    pub fn with_tables(self, tables: &[&str]) -> Self {
        *self.state.tables.lock() = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Delay applied to every statement
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Delay applied to `open`
    pub fn set_open_latency(&self, latency: Duration) {
        *self.state.open_latency.lock() = latency;
    }

    /// Make the next opens fail with `message`; `None` clears it
    pub fn fail_open(&self, message: Option<&str>) {
        *self.state.fail_open.lock() = message.map(str::to_string);
    }

    /// Make `close` fail (the connection still counts as closed)
    pub fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Statements containing `pattern` fail with a query error
    pub fn fail_statements_containing(&self, pattern: &str) {
        self.state.failing.lock().push(pattern.to_string());
    }

    /// Connections currently open
    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections observed
    pub fn max_live_connections(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }
}

impl DriverFactory for MemoryDriverFactory {
    fn build(&self, config: &ConnectionConfig) -> Result<Arc<dyn DatabaseDriver>, DriverError> {
        Ok(Arc::new(MemoryDriver {
            state: self.state.clone(),
            database: config.database.clone().unwrap_or_else(|| "memory".to_string()),
            open: AtomicBool::new(false),
        }))
    }
}

/// A fake connection whose statements echo back as rows
pub struct MemoryDriver {
    state: Arc<MemoryState>,
    database: String,
    open: AtomicBool,
}

impl MemoryDriver {
    fn require_open(&self) -> Result<(), DriverError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::NotOpen)
        }
    }

    async fn run(&self, sql: &str) -> Result<RowSet, DriverError> {
        self.require_open()?;
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.record(sql);
        self.state.check(sql)?;
        Ok(self.state.rows_for(sql))
    }
}

struct TokenCanceler(CancellationToken);

impl QueryCanceler for TokenCanceler {
    fn cancel(&self) {
        self.0.cancel();
    }
}

#[async_trait]
impl DatabaseDriver for MemoryDriver {
    fn connection_type(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> Result<(), DriverError> {
        let latency = *self.state.open_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = self.state.fail_open.lock().clone() {
            return Err(DriverError::Connection(message));
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_live.fetch_max(live, Ordering::SeqCst);
            self.state.opened.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("close refused".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError> {
        self.run(sql).await
    }

    async fn execute_command(&self, sql: &str) -> Result<Vec<RowSet>, DriverError> {
        let mut results = Vec::new();
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            results.push(self.run(statement).await?);
        }
        Ok(results)
    }

    fn start(&self, sql: &str) -> RunningQuery {
        let token = CancellationToken::new();
        let state = self.state.clone();
        let open = self.open.load(Ordering::SeqCst);
        let sql = sql.to_string();
        let cancelled = token.clone();

        RunningQuery {
            canceler: Arc::new(TokenCanceler(token)),
            result: Box::pin(async move {
                if !open {
                    return Err(DriverError::NotOpen);
                }
                let latency = *state.latency.lock();
                tokio::select! {
                    _ = cancelled.cancelled() => Err(DriverError::Interrupted),
                    _ = tokio::time::sleep(latency) => {
                        state.record(&sql);
                        state.check(&sql)?;
                        Ok(state.rows_for(&sql))
                    }
                }
            }),
        }
    }

    async fn reserve(&self) -> Result<Arc<dyn ReservedConnection>, DriverError> {
        self.require_open()?;
        Ok(Arc::new(MemoryReserved {
            state: self.state.clone(),
            released: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
        }))
    }

    async fn version_string(&self) -> Result<String, DriverError> {
        self.require_open()?;
        Ok("Memory 1.0".to_string())
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            cancelable_queries: true,
            transactions: true,
            ..SupportedFeatures::default()
        }
    }

    async fn list_databases(&self) -> Result<Vec<String>, DriverError> {
        self.require_open()?;
        Ok(vec![self.database.clone()])
    }

    async fn list_tables(&self, filter: &ListFilter) -> Result<Vec<TableDescriptor>, DriverError> {
        self.require_open()?;
        Ok(self
            .state
            .tables
            .lock()
            .iter()
            .filter(|name| filter.matches(name))
            .map(|name| TableDescriptor {
                name: name.clone(),
                schema: None,
                entity_type: TableKind::Table,
            })
            .collect())
    }

    async fn list_views(&self, _filter: &ListFilter) -> Result<Vec<TableDescriptor>, DriverError> {
        self.require_open()?;
        Ok(Vec::new())
    }

    async fn list_table_columns(
        &self,
        table: &TableRef,
    ) -> Result<Vec<ColumnDescriptor>, DriverError> {
        self.require_open()?;
        if !self.state.tables.lock().contains(&table.table) {
            return Err(DriverError::query(format!("Table {} not found", table.table)));
        }
        Ok(vec![ColumnDescriptor {
            column_name: "id".to_string(),
            data_type: "integer".to_string(),
            nullable: false,
            default_value: None,
            primary_key: true,
            ordinal_position: 1,
        }])
    }

    async fn select_top(&self, request: &TablePageRequest) -> Result<TablePage, DriverError> {
        self.require_open()?;
        Ok(TablePage {
            result: Vec::new(),
            fields: Vec::new(),
            offset: request.offset,
            limit: request.limit,
            total: 0,
        })
    }
}

struct MemoryReserved {
    state: Arc<MemoryState>,
    released: AtomicBool,
    in_transaction: AtomicBool,
}

#[async_trait]
impl ReservedConnection for MemoryReserved {
    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DriverError::NotOpen);
        }
        self.state.record(sql);
        self.state.check(sql)?;
        match command_tag(sql).as_str() {
            "BEGIN" => self.in_transaction.store(true, Ordering::SeqCst),
            "COMMIT" | "ROLLBACK" => self.in_transaction.store(false, Ordering::SeqCst),
            _ => {}
        }
        Ok(self.state.rows_for(sql))
    }

    async fn release(&self) -> Result<(), DriverError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.state.record("ROLLBACK");
        }
        Ok(())
    }
}
