//! Data types exchanged with database drivers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connection parameters supplied by a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Driver name (`sqlite`, `memory`, ...)
    #[serde(default, alias = "connectionType")]
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Database to open; a file path for SQLite
    #[serde(default, alias = "defaultDatabase", skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Driver-specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

impl ConnectionConfig {
    /// Config for the given driver and database
    pub fn new(connection_type: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            connection_type: connection_type.into(),
            database: Some(database.into()),
            ..Self::default()
        }
    }

    /// True when the config names no driver at all
    pub fn is_empty(&self) -> bool {
        self.connection_type.trim().is_empty()
    }

    /// Same config pointed at another database
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..self.clone()
        }
    }
}

/// A single row keyed by column name
pub type Row = Map<String, Value>;

/// Metadata for one result column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// Result of executing one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub rows: Vec<Row>,
    pub columns: Vec<ColumnMeta>,
    /// Rows returned, or rows affected for data-modifying statements
    pub row_count: u64,
    /// Statement verb (`SELECT`, `INSERT`, ...)
    pub command_tag: String,
}

impl RowSet {
    /// Empty result tagged with the statement verb
    pub fn empty(command_tag: impl Into<String>) -> Self {
        Self {
            command_tag: command_tag.into(),
            ..Self::default()
        }
    }
}

/// First keyword of a statement, upper-cased
pub fn command_tag(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map(|word| word.trim_end_matches(';').to_ascii_uppercase())
        .unwrap_or_default()
}

/// A table addressed by name and optional schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl TableRef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
        }
    }
}

/// Name filter for listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Case-insensitive substring match on the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, name: &str) -> bool {
        match &self.name {
            Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
}

/// A table or view in a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub entity_type: TableKind,
}

/// A stored routine in a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub routine_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub column_name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub primary_key: bool,
    pub ordinal_position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub name: String,
    pub table: String,
    /// Full trigger definition as stored by the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

/// A foreign key relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub constraint_name: String,
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub on_update: String,
    pub on_delete: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProperties {
    pub name: String,
    pub row_count: u64,
    pub column_count: u32,
    pub indexes: Vec<IndexDescriptor>,
    pub triggers: Vec<TriggerDescriptor>,
    pub keys: Vec<KeyDescriptor>,
}

/// A window into a table's rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePageRequest {
    #[serde(flatten)]
    pub table: TableRef,
    #[serde(default, deserialize_with = "crate::de::u64_lenient")]
    pub offset: u64,
    #[serde(default = "default_page_limit", deserialize_with = "crate::de::u64_lenient")]
    pub limit: u64,
}

fn default_page_limit() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePage {
    pub result: Vec<Row>,
    pub fields: Vec<ColumnMeta>,
    pub offset: u64,
    pub limit: u64,
    /// Total rows in the table
    pub total: u64,
}

/// Optional capabilities a driver reports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupportedFeatures {
    pub cancelable_queries: bool,
    pub transactions: bool,
    pub multiple_databases: bool,
    pub schemas: bool,
    pub triggers: bool,
    pub alter_table: bool,
}

/// Column definition for create/alter table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(flatten)]
    pub table: TableRef,
    pub columns: Vec<ColumnSpec>,
}

/// Changes applied by alter table, in order: renames, adds, drops
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterSpec {
    #[serde(default)]
    pub rename_columns: Vec<ColumnRename>,
    #[serde(default)]
    pub add_columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub drop_columns: Vec<String>,
}

impl AlterSpec {
    pub fn is_empty(&self) -> bool {
        self.rename_columns.is_empty() && self.add_columns.is_empty() && self.drop_columns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub from: String,
    pub to: String,
}
