//! SQLite driver backed by rusqlite
//!
//! All rusqlite calls run on the blocking pool. A driver owns one primary
//! connection shared by every non-transactional statement; each reservation
//! opens its own connection on the same database so tab transactions stay
//! isolated from each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, ErrorCode, InterruptHandle, OpenFlags, Statement};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::DriverError;

use super::traits::{DatabaseDriver, DriverFactory, QueryCanceler, ReservedConnection, RunningQuery};
use super::types::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds [`SqliteDriver`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDriverFactory;

impl DriverFactory for SqliteDriverFactory {
    fn build(&self, config: &ConnectionConfig) -> Result<Arc<dyn DatabaseDriver>, DriverError> {
        Ok(Arc::new(SqliteDriver::new(config)))
    }
}

/// Where the database lives
#[derive(Debug, Clone)]
enum Target {
    File(String),
    /// Private shared-cache memory database, alive while the primary connection is open
    Memory(String),
}

impl Target {
    fn from_config(config: &ConnectionConfig) -> Self {
        match config.database.as_deref().map(str::trim) {
            None | Some("") | Some(":memory:") => Self::Memory(format!(
                "file:apiary-{}?mode=memory&cache=shared",
                Uuid::new_v4().simple()
            )),
            Some(path) => Self::File(path.to_string()),
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::File(path) | Self::Memory(path) => path,
        }
    }
}

struct Inner {
    target: Target,
    read_only: bool,
    conn: Mutex<Option<Connection>>,
    interrupt: Mutex<Option<InterruptHandle>>,
    /// Ticket of the cancelable statement currently on the primary connection
    running: Mutex<Option<u64>>,
    next_ticket: AtomicU64,
}

impl Inner {
    fn connect(&self) -> Result<Connection, DriverError> {
        let flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::default()
        };
        let conn = Connection::open_with_flags(self.target.path(), flags)
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(conn)
    }
}

/// A SQLite database file (or private memory database)
pub struct SqliteDriver {
    inner: Arc<Inner>,
}

impl SqliteDriver {
    pub fn new(config: &ConnectionConfig) -> Self {
        let read_only = config
            .options
            .get("read_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            inner: Arc::new(Inner {
                target: Target::from_config(config),
                read_only,
                conn: Mutex::new(None),
                interrupt: Mutex::new(None),
                running: Mutex::new(None),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DriverError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.conn.lock();
            let conn = guard.as_mut().ok_or(DriverError::NotOpen)?;
            f(conn)
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
    }
}

struct SqliteCanceler {
    inner: Arc<Inner>,
    ticket: u64,
    cancelled: AtomicBool,
}

impl QueryCanceler for SqliteCanceler {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let running = self.inner.running.lock();
        if *running == Some(self.ticket) {
            if let Some(handle) = self.inner.interrupt.lock().as_ref() {
                handle.interrupt();
            }
        }
    }
}

fn run_cancelable(inner: &Inner, canceler: &SqliteCanceler, sql: &str) -> Result<RowSet, DriverError> {
    let guard = inner.conn.lock();
    let conn = guard.as_ref().ok_or(DriverError::NotOpen)?;
    {
        let mut running = inner.running.lock();
        if canceler.cancelled.load(Ordering::SeqCst) {
            return Err(DriverError::Interrupted);
        }
        *running = Some(canceler.ticket);
    }
    let result = run_batch(conn, sql).map(last_result);
    *inner.running.lock() = None;
    result
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn connection_type(&self) -> &str {
        "sqlite"
    }

    async fn open(&self) -> Result<(), DriverError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let conn = inner.connect()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| DriverError::Connection(e.to_string()))?;
            *inner.interrupt.lock() = Some(conn.get_interrupt_handle());
            *inner.conn.lock() = Some(conn);
            Ok(())
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))??;

        debug!(database = %self.inner.target.path(), "SQLite connection opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.interrupt.lock().take();
            match inner.conn.lock().take() {
                Some(conn) => conn
                    .close()
                    .map_err(|(_, e)| DriverError::Connection(e.to_string())),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
    }

    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| run_batch(conn, &sql).map(last_result))
            .await
    }

    async fn execute_command(&self, sql: &str) -> Result<Vec<RowSet>, DriverError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| run_batch(conn, &sql)).await
    }

    fn start(&self, sql: &str) -> RunningQuery {
        let canceler = Arc::new(SqliteCanceler {
            inner: self.inner.clone(),
            ticket: self.inner.next_ticket.fetch_add(1, Ordering::SeqCst),
            cancelled: AtomicBool::new(false),
        });

        let inner = self.inner.clone();
        let task_canceler = canceler.clone();
        let sql = sql.to_string();
        let handle =
            tokio::task::spawn_blocking(move || run_cancelable(&inner, &task_canceler, &sql));

        RunningQuery {
            canceler,
            result: Box::pin(async move {
                handle
                    .await
                    .map_err(|e| DriverError::Task(e.to_string()))?
            }),
        }
    }

    async fn reserve(&self) -> Result<Arc<dyn ReservedConnection>, DriverError> {
        let inner = self.inner.clone();
        let conn = tokio::task::spawn_blocking(move || {
            if inner.conn.lock().is_none() {
                return Err(DriverError::NotOpen);
            }
            inner.connect()
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))??;

        Ok(Arc::new(SqliteReserved {
            conn: Arc::new(Mutex::new(Some(conn))),
        }))
    }

    async fn version_string(&self) -> Result<String, DriverError> {
        self.with_conn(|conn| {
            let version: String = conn
                .query_row("SELECT sqlite_version()", [], |row| row.get(0))
                .map_err(query_error)?;
            Ok(format!("SQLite {version}"))
        })
        .await
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            cancelable_queries: true,
            transactions: true,
            multiple_databases: false,
            schemas: false,
            triggers: true,
            alter_table: true,
        }
    }

    async fn list_databases(&self) -> Result<Vec<String>, DriverError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM pragma_database_list ORDER BY seq")
                .map_err(query_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(query_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_error)?;
            Ok(names)
        })
        .await
    }

    async fn list_tables(&self, filter: &ListFilter) -> Result<Vec<TableDescriptor>, DriverError> {
        let filter = filter.clone();
        self.with_conn(move |conn| list_master(conn, "table", TableKind::Table, &filter))
            .await
    }

    async fn list_views(&self, filter: &ListFilter) -> Result<Vec<TableDescriptor>, DriverError> {
        let filter = filter.clone();
        self.with_conn(move |conn| list_master(conn, "view", TableKind::View, &filter))
            .await
    }

    async fn list_table_columns(
        &self,
        table: &TableRef,
    ) -> Result<Vec<ColumnDescriptor>, DriverError> {
        let table = table.clone();
        self.with_conn(move |conn| table_columns(conn, &table)).await
    }

    async fn list_table_indexes(
        &self,
        table: &TableRef,
    ) -> Result<Vec<IndexDescriptor>, DriverError> {
        let table = table.clone();
        self.with_conn(move |conn| table_indexes(conn, &table)).await
    }

    async fn list_table_triggers(
        &self,
        table: &TableRef,
    ) -> Result<Vec<TriggerDescriptor>, DriverError> {
        let table = table.clone();
        self.with_conn(move |conn| table_triggers(conn, &table)).await
    }

    async fn get_table_keys(&self, table: &TableRef) -> Result<Vec<KeyDescriptor>, DriverError> {
        let table = table.clone();
        self.with_conn(move |conn| table_keys(conn, &table)).await
    }

    async fn get_table_properties(&self, table: &TableRef) -> Result<TableProperties, DriverError> {
        let table = table.clone();
        self.with_conn(move |conn| {
            require_table(conn, &table)?;
            let row_count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", qualified(&table)), [], |row| {
                    row.get(0)
                })
                .map_err(query_error)?;
            Ok(TableProperties {
                name: table.table.clone(),
                row_count: row_count.max(0) as u64,
                column_count: table_columns(conn, &table)?.len() as u32,
                indexes: table_indexes(conn, &table)?,
                triggers: table_triggers(conn, &table)?,
                keys: table_keys(conn, &table)?,
            })
        })
        .await
    }

    async fn get_table_create_script(&self, table: &TableRef) -> Result<String, DriverError> {
        let table = table.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT sql FROM {}.sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
                quote_ident(schema_of(&table))
            );
            let script: Option<String> = conn
                .query_row(&sql, [&table.table], |row| row.get(0))
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        DriverError::query(format!("Table {} not found", table.table))
                    }
                    other => query_error(other),
                })?;
            Ok(script.map(|s| format!("{s};")).unwrap_or_default())
        })
        .await
    }

    async fn select_top(&self, request: &TablePageRequest) -> Result<TablePage, DriverError> {
        let request = request.clone();
        self.with_conn(move |conn| {
            let target = qualified(&request.table);
            let total: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {target}"), [], |row| row.get(0))
                .map_err(query_error)?;
            let sql = format!(
                "SELECT * FROM {target} LIMIT {} OFFSET {}",
                request.limit, request.offset
            );
            let mut stmt = conn.prepare(&sql).map_err(query_error)?;
            let rows = collect_rows(&mut stmt, &sql)?;
            Ok(TablePage {
                result: rows.rows,
                fields: rows.columns,
                offset: request.offset,
                limit: request.limit,
                total: total.max(0) as u64,
            })
        })
        .await
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<(), DriverError> {
        let sql = create_table_sql(spec)?;
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(query_error))
            .await
    }

    async fn alter_table(&self, table: &TableRef, changes: &AlterSpec) -> Result<(), DriverError> {
        let statements = alter_table_sql(table, changes);
        if statements.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(query_error)?;
            for sql in &statements {
                tx.execute_batch(sql).map_err(query_error)?;
            }
            tx.commit().map_err(query_error)
        })
        .await
    }

    async fn drop_table(&self, table: &TableRef) -> Result<(), DriverError> {
        let sql = format!("DROP TABLE {}", qualified(table));
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(query_error))
            .await
    }
}

/// A dedicated connection for one tab's transaction
struct SqliteReserved {
    conn: Arc<Mutex<Option<Connection>>>,
}

#[async_trait]
impl ReservedConnection for SqliteReserved {
    async fn execute(&self, sql: &str) -> Result<RowSet, DriverError> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard.as_ref().ok_or(DriverError::NotOpen)?;
            run_batch(conn, &sql).map(last_result)
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard.as_ref().ok_or(DriverError::NotOpen)?;
            // Nothing to undo outside a transaction
            if conn.is_autocommit() {
                return Ok(());
            }
            conn.execute_batch("ROLLBACK").map_err(query_error)
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
    }

    async fn release(&self) -> Result<(), DriverError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let Some(conn) = conn.lock().take() else {
                return Ok(());
            };
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK").map_err(query_error)?;
            }
            conn.close()
                .map_err(|(_, e)| DriverError::Connection(e.to_string()))
        })
        .await
        .map_err(|e| DriverError::Task(e.to_string()))?
    }
}

fn query_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::OperationInterrupted =>
        {
            DriverError::Interrupted
        }
        rusqlite::Error::SqliteFailure(failure, _) => DriverError::Query {
            message: err.to_string(),
            detail: Some(format!("SQLite error code {}", failure.extended_code)),
        },
        _ => DriverError::query(err.to_string()),
    }
}

/// Run every statement in `sql`, one result set per statement
fn run_batch(conn: &Connection, sql: &str) -> Result<Vec<RowSet>, DriverError> {
    let mut batch = Batch::new(conn, sql);
    let mut results = Vec::new();
    while let Some(mut stmt) = batch.next().map_err(query_error)? {
        let text = stmt.expanded_sql().unwrap_or_default();
        results.push(run_statement(conn, &mut stmt, &text)?);
    }
    Ok(results)
}

fn last_result(results: Vec<RowSet>) -> RowSet {
    results.into_iter().last().unwrap_or_default()
}

fn run_statement(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    sql: &str,
) -> Result<RowSet, DriverError> {
    if stmt.column_count() == 0 {
        stmt.raw_execute().map_err(query_error)?;
        return Ok(RowSet {
            row_count: conn.changes() as u64,
            ..RowSet::empty(command_tag(sql))
        });
    }
    collect_rows(stmt, sql)
}

fn collect_rows(stmt: &mut Statement<'_>, sql: &str) -> Result<RowSet, DriverError> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut types: Vec<Option<&'static str>> = vec![None; names.len()];
    let mut rows = Vec::new();

    let mut cursor = stmt.raw_query();
    while let Some(row) = cursor.next().map_err(query_error)? {
        let mut map = Row::new();
        for (idx, name) in names.iter().enumerate() {
            let value = row.get_ref(idx).map_err(query_error)?;
            if types[idx].is_none() {
                types[idx] = value_type(&value);
            }
            map.insert(name.clone(), to_json(value));
        }
        rows.push(map);
    }

    let columns = names
        .into_iter()
        .zip(types)
        .map(|(name, data_type)| ColumnMeta {
            name,
            data_type: data_type.map(str::to_string),
        })
        .collect();

    Ok(RowSet {
        row_count: rows.len() as u64,
        rows,
        columns,
        command_tag: command_tag(sql),
    })
}

fn value_type(value: &ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("integer"),
        ValueRef::Real(_) => Some("real"),
        ValueRef::Text(_) => Some("text"),
        ValueRef::Blob(_) => Some("blob"),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn schema_of(table: &TableRef) -> &str {
    table.schema.as_deref().unwrap_or("main")
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(schema_of(table)), quote_ident(&table.table))
}

fn list_master(
    conn: &Connection,
    kind: &str,
    entity_type: TableKind,
    filter: &ListFilter,
) -> Result<Vec<TableDescriptor>, DriverError> {
    let schema = filter.schema.as_deref().unwrap_or("main");
    let sql = format!(
        "SELECT name FROM {}.sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        quote_ident(schema)
    );
    let mut stmt = conn.prepare(&sql).map_err(query_error)?;
    let names = stmt
        .query_map([kind], |row| row.get::<_, String>(0))
        .map_err(query_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;

    Ok(names
        .into_iter()
        .filter(|name| filter.matches(name))
        .map(|name| TableDescriptor {
            name,
            schema: filter.schema.clone(),
            entity_type,
        })
        .collect())
}

fn require_table(conn: &Connection, table: &TableRef) -> Result<(), DriverError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
        quote_ident(schema_of(table))
    );
    let found: i64 = conn
        .query_row(&sql, [&table.table], |row| row.get(0))
        .map_err(query_error)?;
    if found == 0 {
        return Err(DriverError::query(format!("Table {} not found", table.table)));
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &TableRef) -> Result<Vec<ColumnDescriptor>, DriverError> {
    require_table(conn, table)?;
    let mut stmt = conn
        .prepare("SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1, ?2)")
        .map_err(query_error)?;
    let columns = stmt
        .query_map([table.table.as_str(), schema_of(table)], |row| {
            Ok(ColumnDescriptor {
                ordinal_position: row.get::<_, u32>(0)? + 1,
                column_name: row.get(1)?,
                data_type: row.get(2)?,
                nullable: row.get::<_, i64>(3)? == 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? > 0,
            })
        })
        .map_err(query_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;
    Ok(columns)
}

fn table_indexes(conn: &Connection, table: &TableRef) -> Result<Vec<IndexDescriptor>, DriverError> {
    require_table(conn, table)?;
    let mut stmt = conn
        .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1, ?2) ORDER BY seq")
        .map_err(query_error)?;
    let listed = stmt
        .query_map([table.table.as_str(), schema_of(table)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(query_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;

    let mut column_stmt = conn
        .prepare("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")
        .map_err(query_error)?;
    let mut indexes = Vec::with_capacity(listed.len());
    for (name, unique, origin) in listed {
        let columns = column_stmt
            .query_map([name.as_str(), schema_of(table)], |row| {
                row.get::<_, Option<String>>(0)
            })
            .map_err(query_error)?
            .filter_map(|col| col.transpose())
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_error)?;
        indexes.push(IndexDescriptor {
            name,
            table: table.table.clone(),
            columns,
            unique,
            primary: origin == "pk",
        });
    }
    Ok(indexes)
}

fn table_triggers(
    conn: &Connection,
    table: &TableRef,
) -> Result<Vec<TriggerDescriptor>, DriverError> {
    let sql = format!(
        "SELECT name, sql FROM {}.sqlite_master WHERE type = 'trigger' AND tbl_name = ?1 ORDER BY name",
        quote_ident(schema_of(table))
    );
    let mut stmt = conn.prepare(&sql).map_err(query_error)?;
    let triggers = stmt
        .query_map([&table.table], |row| {
            Ok(TriggerDescriptor {
                name: row.get(0)?,
                table: table.table.clone(),
                definition: row.get(1)?,
            })
        })
        .map_err(query_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;
    Ok(triggers)
}

fn table_keys(conn: &Connection, table: &TableRef) -> Result<Vec<KeyDescriptor>, DriverError> {
    require_table(conn, table)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
             FROM pragma_foreign_key_list(?1, ?2) ORDER BY id, seq",
        )
        .map_err(query_error)?;
    let keys = stmt
        .query_map([table.table.as_str(), schema_of(table)], |row| {
            let id: i64 = row.get(0)?;
            Ok(KeyDescriptor {
                constraint_name: format!("fk_{}_{id}", table.table),
                from_table: table.table.clone(),
                to_table: row.get(1)?,
                from_column: row.get(2)?,
                to_column: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                on_update: row.get(4)?,
                on_delete: row.get(5)?,
            })
        })
        .map_err(query_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;
    Ok(keys)
}

fn column_sql(column: &ColumnSpec) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), column.data_type);
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_value {
        sql.push_str(&format!(" DEFAULT {default}"));
    }
    sql
}

fn create_table_sql(spec: &TableSpec) -> Result<String, DriverError> {
    if spec.columns.is_empty() {
        return Err(DriverError::query(format!(
            "Table {} needs at least one column",
            spec.table.table
        )));
    }

    let mut parts: Vec<String> = spec.columns.iter().map(column_sql).collect();
    let keys: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_ident(&c.name))
        .collect();
    if !keys.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }

    Ok(format!(
        "CREATE TABLE {} ({})",
        qualified(&spec.table),
        parts.join(", ")
    ))
}

fn alter_table_sql(table: &TableRef, changes: &AlterSpec) -> Vec<String> {
    let target = qualified(table);
    let renames = changes.rename_columns.iter().map(|r| {
        format!(
            "ALTER TABLE {target} RENAME COLUMN {} TO {}",
            quote_ident(&r.from),
            quote_ident(&r.to)
        )
    });
    let adds = changes
        .add_columns
        .iter()
        .map(|c| format!("ALTER TABLE {target} ADD COLUMN {}", column_sql(c)));
    let drops = changes
        .drop_columns
        .iter()
        .map(|c| format!("ALTER TABLE {target} DROP COLUMN {}", quote_ident(c)));

    renames.chain(adds).chain(drops).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> SqliteDriver {
        let driver = SqliteDriver::new(&ConnectionConfig::new("sqlite", ":memory:"));
        driver.open().await.unwrap();
        driver
            .execute_command(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, avatar BLOB);
                 CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id) ON DELETE CASCADE, total REAL);
                 CREATE INDEX idx_orders_user ON orders(user_id);
                 CREATE VIEW big_orders AS SELECT * FROM orders WHERE total > 100;
                 INSERT INTO users (name, avatar) VALUES ('alice', x'0102'), ('bob', NULL);",
            )
            .await
            .unwrap();
        driver
    }

    // ==================== Execution Tests ====================

    #[tokio::test]
    async fn execute_returns_rows_and_metadata() {
        let driver = open_memory().await;
        let rows = driver
            .execute("SELECT id, name, avatar FROM users ORDER BY id")
            .await
            .unwrap();

        assert_eq!(rows.row_count, 2);
        assert_eq!(rows.command_tag, "SELECT");
        assert_eq!(rows.columns[0].name, "id");
        assert_eq!(rows.columns[0].data_type.as_deref(), Some("integer"));
        assert_eq!(rows.rows[0]["name"], "alice");
        assert_eq!(rows.rows[0]["avatar"], BASE64.encode([1u8, 2]));
        assert_eq!(rows.rows[1]["avatar"], Value::Null);
    }

    #[tokio::test]
    async fn execute_reports_affected_rows() {
        let driver = open_memory().await;
        let rows = driver
            .execute("UPDATE users SET name = upper(name)")
            .await
            .unwrap();

        assert_eq!(rows.row_count, 2);
        assert_eq!(rows.command_tag, "UPDATE");
        assert!(rows.rows.is_empty());
    }

    #[tokio::test]
    async fn execute_command_returns_one_result_per_statement() {
        let driver = open_memory().await;
        let results = driver
            .execute_command("SELECT 1 AS a; SELECT 2 AS b; DELETE FROM orders")
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].rows[0]["a"], 1);
        assert_eq!(results[1].rows[0]["b"], 2);
        assert_eq!(results[2].command_tag, "DELETE");
    }

    #[tokio::test]
    async fn query_error_carries_driver_message() {
        let driver = open_memory().await;
        let err = driver.execute("SELECT * FROM missing").await.unwrap_err();

        match err {
            DriverError::Query { message, detail } => {
                assert!(message.contains("no such table: missing"));
                assert!(detail.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_before_open_fails() {
        let driver = SqliteDriver::new(&ConnectionConfig::new("sqlite", ":memory:"));
        assert_eq!(driver.execute("SELECT 1").await, Err(DriverError::NotOpen));
    }

    #[tokio::test]
    async fn open_missing_read_only_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConnectionConfig::new("sqlite", dir.path().join("nope.db").to_string_lossy());
        config.options.insert("read_only".to_string(), Value::Bool(true));

        let err = SqliteDriver::new(&config).open().await.unwrap_err();
        assert!(matches!(err, DriverError::Connection(_)));
    }

    // ==================== Cancellation Tests ====================

    #[tokio::test]
    async fn cancel_interrupts_running_statement() {
        let driver = open_memory().await;
        let running = driver.start(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n",
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        running.canceler.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), running.result)
            .await
            .unwrap();
        assert_eq!(result, Err(DriverError::Interrupted));

        // The shared connection is still usable afterwards
        let rows = driver.execute("SELECT count(*) AS n FROM users").await.unwrap();
        assert_eq!(rows.rows[0]["n"], 2);
    }

    #[tokio::test]
    async fn started_statement_completes_normally() {
        let driver = open_memory().await;
        let running = driver.start("SELECT name FROM users ORDER BY id");
        let rows = running.result.await.unwrap();
        assert_eq!(rows.row_count, 2);
    }

    // ==================== Reservation Tests ====================

    #[tokio::test]
    async fn reserved_connection_commits_on_same_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let driver = SqliteDriver::new(&ConnectionConfig::new("sqlite", path.to_string_lossy()));
        driver.open().await.unwrap();
        driver.execute("CREATE TABLE t (x INTEGER)").await.unwrap();

        let reserved = driver.reserve().await.unwrap();
        reserved.begin().await.unwrap();
        reserved.execute("INSERT INTO t VALUES (1)").await.unwrap();
        reserved.commit().await.unwrap();
        reserved.release().await.unwrap();

        let rows = driver.execute("SELECT count(*) AS n FROM t").await.unwrap();
        assert_eq!(rows.rows[0]["n"], 1);
    }

    #[tokio::test]
    async fn release_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let driver = SqliteDriver::new(&ConnectionConfig::new("sqlite", path.to_string_lossy()));
        driver.open().await.unwrap();
        driver.execute("CREATE TABLE t (x INTEGER)").await.unwrap();

        let reserved = driver.reserve().await.unwrap();
        reserved.begin().await.unwrap();
        reserved.execute("INSERT INTO t VALUES (1)").await.unwrap();
        reserved.release().await.unwrap();

        let rows = driver.execute("SELECT count(*) AS n FROM t").await.unwrap();
        assert_eq!(rows.rows[0]["n"], 0);
    }

    // ==================== Introspection Tests ====================

    #[tokio::test]
    async fn lists_tables_and_views() {
        let driver = open_memory().await;

        let tables = driver.list_tables(&ListFilter::default()).await.unwrap();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);

        let views = driver.list_views(&ListFilter::default()).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].entity_type, TableKind::View);
    }

    #[tokio::test]
    async fn describes_columns_indexes_and_keys() {
        let driver = open_memory().await;
        let orders = TableRef::new("orders");

        let columns = driver.list_table_columns(&orders).await.unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert_eq!(columns[2].data_type, "REAL");

        let indexes = driver.list_table_indexes(&orders).await.unwrap();
        assert_eq!(indexes[0].name, "idx_orders_user");
        assert_eq!(indexes[0].columns, vec!["user_id"]);

        let keys = driver.get_table_keys(&orders).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].to_table, "users");
        assert_eq!(keys[0].on_delete, "CASCADE");
    }

    #[tokio::test]
    async fn columns_of_missing_table_fail() {
        let driver = open_memory().await;
        let err = driver
            .list_table_columns(&TableRef::new("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::query("Table ghost not found"));
    }

    #[tokio::test]
    async fn select_top_pages_rows() {
        let driver = open_memory().await;
        let page = driver
            .select_top(&TablePageRequest {
                table: TableRef::new("users"),
                offset: 1,
                limit: 10,
            })
            .await
            .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.result.len(), 1);
        assert_eq!(page.result[0]["name"], "bob");
    }

    #[tokio::test]
    async fn create_alter_and_drop_table() {
        let driver = open_memory().await;
        let spec = TableSpec {
            table: TableRef::new("notes"),
            columns: vec![
                ColumnSpec {
                    name: "id".to_string(),
                    data_type: "INTEGER".to_string(),
                    nullable: false,
                    primary_key: true,
                    default_value: None,
                },
                ColumnSpec {
                    name: "body".to_string(),
                    data_type: "TEXT".to_string(),
                    nullable: true,
                    primary_key: false,
                    default_value: Some("''".to_string()),
                },
            ],
        };
        driver.create_table(&spec).await.unwrap();

        let script = driver
            .get_table_create_script(&TableRef::new("notes"))
            .await
            .unwrap();
        assert!(script.starts_with("CREATE TABLE"));

        driver
            .alter_table(
                &TableRef::new("notes"),
                &AlterSpec {
                    rename_columns: vec![ColumnRename {
                        from: "body".to_string(),
                        to: "content".to_string(),
                    }],
                    add_columns: vec![ColumnSpec {
                        name: "pinned".to_string(),
                        data_type: "INTEGER".to_string(),
                        nullable: true,
                        primary_key: false,
                        default_value: Some("0".to_string()),
                    }],
                    drop_columns: vec![],
                },
            )
            .await
            .unwrap();

        let columns = driver
            .list_table_columns(&TableRef::new("notes"))
            .await
            .unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.column_name.as_str()).collect();
        assert_eq!(names, vec!["id", "content", "pinned"]);

        driver.drop_table(&TableRef::new("notes")).await.unwrap();
        let tables = driver.list_tables(&ListFilter::default()).await.unwrap();
        assert!(tables.iter().all(|t| t.name != "notes"));
    }

    #[tokio::test]
    async fn version_string_names_sqlite() {
        let driver = open_memory().await;
        assert!(driver.version_string().await.unwrap().starts_with("SQLite 3."));
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
