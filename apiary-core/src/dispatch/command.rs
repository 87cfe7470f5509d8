//! The command catalog
//!
//! Every command a client can send, with the HTTP route it travels on. The
//! server registers its routes from this table and the client resolves calls
//! through it, so the two cannot drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Whether arguments travel in the query string rather than a JSON body
    pub fn uses_query_string(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method plus path template relative to the API base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub method: HttpMethod,
    /// Template such as `/schema/tables/:table/columns`
    pub path: &'static str,
}

impl Route {
    const fn new(method: HttpMethod, path: &'static str) -> Self {
        Self { method, path }
    }

    /// Names of the `:param` segments, in order
    pub fn params(&self) -> Vec<&'static str> {
        self.path
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
            .collect()
    }
}

/// A route with its parameters filled in
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub method: HttpMethod,
    /// Literal path segments, unescaped
    pub segments: Vec<String>,
    /// Arguments not consumed by the path
    pub args: Map<String, Value>,
}

impl ResolvedRoute {
    /// Display form of the path; segments are not percent-encoded
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

/// Every command in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Identity
    Login,
    Register,
    Logout,

    // Connection lifecycle
    CreateConnection,
    TestConnection,
    Connect,
    Disconnect,
    ChangeDatabase,
    ListDatabases,
    SupportedFeatures,
    VersionString,

    // Statements
    ExecuteQuery,
    StartQuery,
    CancelQuery,
    ExecuteCommand,

    // Transactions
    ReserveConnection,
    ReleaseConnection,
    StartTransaction,
    CommitTransaction,
    RollbackTransaction,

    // Schema
    ListTables,
    ListViews,
    ListMaterializedViews,
    ListRoutines,
    ListSchemas,
    ListTableColumns,
    ListTableIndexes,
    ListTableTriggers,
    GetTableKeys,
    GetTableProperties,
    GetTableCreateScript,
    SelectTop,
    CreateTable,
    AlterTable,
    DropElement,
}

impl Command {
    pub const ALL: &'static [Command] = &[
        Command::Login,
        Command::Register,
        Command::Logout,
        Command::CreateConnection,
        Command::TestConnection,
        Command::Connect,
        Command::Disconnect,
        Command::ChangeDatabase,
        Command::ListDatabases,
        Command::SupportedFeatures,
        Command::VersionString,
        Command::ExecuteQuery,
        Command::StartQuery,
        Command::CancelQuery,
        Command::ExecuteCommand,
        Command::ReserveConnection,
        Command::ReleaseConnection,
        Command::StartTransaction,
        Command::CommitTransaction,
        Command::RollbackTransaction,
        Command::ListTables,
        Command::ListViews,
        Command::ListMaterializedViews,
        Command::ListRoutines,
        Command::ListSchemas,
        Command::ListTableColumns,
        Command::ListTableIndexes,
        Command::ListTableTriggers,
        Command::GetTableKeys,
        Command::GetTableProperties,
        Command::GetTableCreateScript,
        Command::SelectTop,
        Command::CreateTable,
        Command::AlterTable,
        Command::DropElement,
    ];

    /// Wire name, e.g. `conn/listTables`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login => "auth/login",
            Self::Register => "auth/register",
            Self::Logout => "auth/logout",
            Self::CreateConnection => "conn/create",
            Self::TestConnection => "conn/test",
            Self::Connect => "conn/connect",
            Self::Disconnect => "conn/disconnect",
            Self::ChangeDatabase => "conn/changeDatabase",
            Self::ListDatabases => "conn/listDatabases",
            Self::SupportedFeatures => "conn/supportedFeatures",
            Self::VersionString => "conn/versionString",
            Self::ExecuteQuery => "conn/executeQuery",
            Self::StartQuery => "conn/query",
            Self::CancelQuery => "conn/cancelQuery",
            Self::ExecuteCommand => "conn/executeCommand",
            Self::ReserveConnection => "conn/reserveConnection",
            Self::ReleaseConnection => "conn/releaseConnection",
            Self::StartTransaction => "conn/startTransaction",
            Self::CommitTransaction => "conn/commitTransaction",
            Self::RollbackTransaction => "conn/rollbackTransaction",
            Self::ListTables => "conn/listTables",
            Self::ListViews => "conn/listViews",
            Self::ListMaterializedViews => "conn/listMaterializedViews",
            Self::ListRoutines => "conn/listRoutines",
            Self::ListSchemas => "conn/listSchemas",
            Self::ListTableColumns => "conn/listTableColumns",
            Self::ListTableIndexes => "conn/listTableIndexes",
            Self::ListTableTriggers => "conn/listTableTriggers",
            Self::GetTableKeys => "conn/getTableKeys",
            Self::GetTableProperties => "conn/getTableProperties",
            Self::GetTableCreateScript => "conn/getTableCreateScript",
            Self::SelectTop => "conn/selectTop",
            Self::CreateTable => "conn/createTable",
            Self::AlterTable => "conn/alterTable",
            Self::DropElement => "conn/dropElement",
        }
    }

    /// Look a command up by wire name
    pub fn from_name(name: &str) -> Result<Self, DispatchError> {
        Self::ALL
            .iter()
            .copied()
            .find(|command| command.name() == name)
            .ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))
    }

    pub fn route(&self) -> Route {
        use HttpMethod::*;
        match self {
            Self::Login => Route::new(Post, "/auth/login"),
            Self::Register => Route::new(Post, "/auth/register"),
            Self::Logout => Route::new(Post, "/auth/logout"),
            Self::CreateConnection => Route::new(Post, "/connections/create"),
            Self::TestConnection => Route::new(Post, "/connections/test"),
            Self::Connect => Route::new(Post, "/connections/connect"),
            Self::Disconnect => Route::new(Post, "/connections/disconnect"),
            Self::ChangeDatabase => Route::new(Post, "/connections/change-database"),
            Self::ListDatabases => Route::new(Get, "/connections/databases"),
            Self::SupportedFeatures => Route::new(Get, "/connections/supported-features"),
            Self::VersionString => Route::new(Get, "/connections/version"),
            Self::ExecuteQuery => Route::new(Post, "/query/execute"),
            Self::StartQuery => Route::new(Post, "/query/start"),
            Self::CancelQuery => Route::new(Post, "/query/cancel"),
            Self::ExecuteCommand => Route::new(Post, "/query/command"),
            Self::ReserveConnection => Route::new(Post, "/query/transaction/reserve"),
            Self::ReleaseConnection => Route::new(Post, "/query/transaction/release"),
            Self::StartTransaction => Route::new(Post, "/query/transaction/start"),
            Self::CommitTransaction => Route::new(Post, "/query/transaction/commit"),
            Self::RollbackTransaction => Route::new(Post, "/query/transaction/rollback"),
            Self::ListTables => Route::new(Get, "/schema/tables"),
            Self::ListViews => Route::new(Get, "/schema/views"),
            Self::ListMaterializedViews => Route::new(Get, "/schema/materialized-views"),
            Self::ListRoutines => Route::new(Get, "/schema/routines"),
            Self::ListSchemas => Route::new(Get, "/schema/schemas"),
            Self::ListTableColumns => Route::new(Get, "/schema/tables/:table/columns"),
            Self::ListTableIndexes => Route::new(Get, "/schema/tables/:table/indexes"),
            Self::ListTableTriggers => Route::new(Get, "/schema/tables/:table/triggers"),
            Self::GetTableKeys => Route::new(Get, "/schema/tables/:table/keys"),
            Self::GetTableProperties => Route::new(Get, "/schema/tables/:table/properties"),
            Self::GetTableCreateScript => Route::new(Get, "/schema/tables/:table/create-script"),
            Self::SelectTop => Route::new(Get, "/schema/tables/:table/data"),
            Self::CreateTable => Route::new(Post, "/schema/tables/:table/create"),
            Self::AlterTable => Route::new(Put, "/schema/tables/:table"),
            Self::DropElement => Route::new(Delete, "/schema/tables/:table"),
        }
    }

    /// Whether the caller must present an identity token
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Login | Self::Register)
    }

    /// Fill the route's `:param` segments from `args`
    ///
    /// Consumed arguments are removed from the returned argument map; string
    /// and number values are accepted.
    pub fn resolve(&self, args: &Value) -> Result<ResolvedRoute, DispatchError> {
        let route = self.route();
        let mut remaining = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(DispatchError::InvalidParams(format!(
                    "{} expects an argument object, got {}",
                    self.name(),
                    type_name(other)
                )));
            }
        };

        let mut segments = Vec::new();
        for segment in route.path.split('/').filter(|s| !s.is_empty()) {
            match segment.strip_prefix(':') {
                Some(param) => {
                    let value = match remaining.remove(param) {
                        Some(Value::String(s)) if !s.is_empty() => s,
                        Some(Value::Number(n)) => n.to_string(),
                        _ => {
                            return Err(DispatchError::MissingParam {
                                command: self.name().to_string(),
                                param: param.to_string(),
                            });
                        }
                    };
                    segments.push(value);
                }
                None => segments.push(segment.to_string()),
            }
        }

        Ok(ResolvedRoute {
            method: route.method,
            segments,
            args: remaining,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Command {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
