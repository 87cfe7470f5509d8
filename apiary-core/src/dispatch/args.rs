//! Typed arguments for catalog commands
//!
//! Field names are snake_case; the camelCase spellings older clients send
//! are accepted as aliases. Numeric ids may arrive as query-string text.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::{AlterSpec, ColumnSpec, ConnectionConfig, TableRef};
use crate::error::DispatchError;
use crate::query::OperationId;
use crate::session::TabId;

/// Decode a command's argument object
pub fn parse<T: DeserializeOwned>(args: Value) -> Result<T, DispatchError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    Ok(serde_json::from_value(args)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginArgs {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterArgs {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseArgs {
    pub database: String,
}

/// A statement, optionally run on a tab's reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementArgs {
    pub query: String,
    #[serde(
        default,
        alias = "tabId",
        deserialize_with = "crate::de::opt_u64_lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub tab_id: Option<TabId>,
}

/// A cancelable statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartQueryArgs {
    pub query: String,
    /// Echoed back on every event; generated when absent
    #[serde(default, alias = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(
        default,
        alias = "tabId",
        deserialize_with = "crate::de::opt_u64_lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub tab_id: Option<TabId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelArgs {
    #[serde(alias = "operationId", alias = "queryId", deserialize_with = "crate::de::u64_lenient")]
    pub operation_id: u64,
}

impl CancelArgs {
    pub fn operation_id(&self) -> OperationId {
        OperationId(self.operation_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandArgs {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabArgs {
    #[serde(alias = "tabId", deserialize_with = "crate::de::u64_lenient")]
    pub tab_id: TabId,
}

/// Table definition for `conn/createTable`; the name comes from the path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableArgs {
    #[serde(flatten)]
    pub table: TableRef,
    #[serde(default, alias = "tableSpec")]
    pub table_spec: Option<TableSpecBody>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpecBody {
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

impl CreateTableArgs {
    /// Columns from either a nested `table_spec` or the top level
    pub fn into_columns(self) -> Vec<ColumnSpec> {
        match self.table_spec {
            Some(spec) if !spec.columns.is_empty() => spec.columns,
            _ => self.columns,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterTableArgs {
    #[serde(flatten)]
    pub table: TableRef,
    #[serde(default, alias = "alterSpec")]
    pub alter_spec: AlterSpec,
}
