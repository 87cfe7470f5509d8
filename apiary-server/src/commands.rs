//! Command execution shared by the HTTP routes and the event socket

use apiary_core::dispatch::args::{
    self, AlterTableArgs, CancelArgs, CommandArgs, ConnectionArgs, CreateTableArgs, DatabaseArgs,
    LoginArgs, RegisterArgs, StartQueryArgs, StatementArgs, TabArgs,
};
use apiary_core::driver::{ListFilter, TablePageRequest, TableRef, TableSpec};
use apiary_core::{
    AuthError, Command, DatabaseDriver, Identity, IdentityProvider, LoginResponse, SessionError,
    TransactionStep,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{AppState, ServerError};

/// Run one catalog command on behalf of `identity`
///
/// `args` is the merged argument object (body, query string and path
/// parameters). Commands that require auth fail with `MissingToken` when
/// `identity` is absent.
pub async fn execute(
    state: &AppState,
    identity: Option<&Identity>,
    command: Command,
    args: Value,
) -> Result<Value, ServerError> {
    debug!(command = command.name(), "Executing command");

    match command {
        Command::Login => {
            let args: LoginArgs = args::parse(args)?;
            let user = state
                .credentials
                .authenticate(&args.username, &args.password)
                .await?;
            info!(user_id = %user.user_id, "User logged in");
            login_response(state, user)
        }
        Command::Register => {
            let args: RegisterArgs = args::parse(args)?;
            let user = state
                .credentials
                .register(&args.username, &args.password, args.email)
                .await?;
            info!(user_id = %user.user_id, "User registered");
            login_response(state, user)
        }
        _ => {
            let identity = identity.ok_or(AuthError::MissingToken)?;
            let session_id = IdentityProvider::session_id_for(identity);
            execute_for_session(state, identity, &session_id, command, args)
                .await
                .map_err(|e| match e {
                    // An authenticated caller without a registry entry has simply never connected
                    ServerError::Session(SessionError::NoSession) => {
                        SessionError::NoConnection.into()
                    }
                    other => other,
                })
        }
    }
}

async fn execute_for_session(
    state: &AppState,
    identity: &Identity,
    session_id: &str,
    command: Command,
    args: Value,
) -> Result<Value, ServerError> {
    let engine = &state.engine;
    let controller = &state.controller;

    let value = match command {
        Command::Login | Command::Register => {
            return Err(ServerError::Internal(format!(
                "{} is not a session command",
                command.name()
            )));
        }
        Command::Logout => {
            let removed = state.registry.remove(session_id).await;
            info!(session_id = %session_id, removed, "User logged out");
            Value::Null
        }

        // Connection lifecycle
        Command::CreateConnection => {
            let args: ConnectionArgs = args::parse(args)?;
            to_value(
                controller
                    .create(session_id, args.config.as_ref(), Some(identity))
                    .await?,
            )?
        }
        Command::TestConnection => {
            let args: ConnectionArgs = args::parse(args)?;
            controller.test(args.config.as_ref(), Some(identity)).await?;
            Value::Null
        }
        Command::Connect => to_value(controller.connect(session_id).await?)?,
        Command::Disconnect => {
            controller.disconnect(session_id).await?;
            Value::Null
        }
        Command::ChangeDatabase => {
            let args: DatabaseArgs = args::parse(args)?;
            to_value(controller.change_database(session_id, &args.database).await?)?
        }
        Command::ListDatabases => {
            let driver = engine.driver(session_id).await?;
            to_value(driver.list_databases().await.map_err(SessionError::query)?)?
        }
        Command::SupportedFeatures => {
            to_value(engine.driver(session_id).await?.supported_features())?
        }
        Command::VersionString => {
            let driver = engine.driver(session_id).await?;
            Value::String(driver.version_string().await.map_err(SessionError::query)?)
        }

        // Statements
        Command::ExecuteQuery => {
            let args: StatementArgs = args::parse(args)?;
            to_value(
                engine
                    .execute_immediate(session_id, &args.query, args.tab_id)
                    .await?,
            )?
        }
        Command::StartQuery => {
            let args: StartQueryArgs = args::parse(args)?;
            let correlation_id = args
                .correlation_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let operation_id = engine
                .start_cancelable(session_id, &args.query, &correlation_id, args.tab_id)
                .await?;
            json!({ "operation_id": operation_id, "correlation_id": correlation_id })
        }
        Command::CancelQuery => {
            let args: CancelArgs = args::parse(args)?;
            let outcome = engine.cancel(session_id, args.operation_id()).await?;
            json!({ "operation_id": args.operation_id, "outcome": outcome })
        }
        Command::ExecuteCommand => {
            let args: CommandArgs = args::parse(args)?;
            let results = engine.execute_command(session_id, &args.command).await?;
            json!({ "results": results })
        }

        // Transactions
        Command::ReserveConnection => {
            let args: TabArgs = args::parse(args)?;
            engine.reserve(session_id, args.tab_id).await?;
            json!({ "tab_id": args.tab_id })
        }
        Command::ReleaseConnection => {
            let args: TabArgs = args::parse(args)?;
            engine.release(session_id, args.tab_id).await?;
            json!({ "tab_id": args.tab_id })
        }
        Command::StartTransaction => transaction(state, session_id, args, TransactionStep::Begin).await?,
        Command::CommitTransaction => transaction(state, session_id, args, TransactionStep::Commit).await?,
        Command::RollbackTransaction => {
            transaction(state, session_id, args, TransactionStep::Rollback).await?
        }

        // Schema
        Command::ListTables => {
            let filter: ListFilter = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            to_value(driver.list_tables(&filter).await.map_err(SessionError::query)?)?
        }
        Command::ListViews => {
            let filter: ListFilter = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            to_value(driver.list_views(&filter).await.map_err(SessionError::query)?)?
        }
        Command::ListMaterializedViews => {
            let filter: ListFilter = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            to_value(
                driver
                    .list_materialized_views(&filter)
                    .await
                    .map_err(SessionError::query)?,
            )?
        }
        Command::ListRoutines => {
            let filter: ListFilter = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            to_value(driver.list_routines(&filter).await.map_err(SessionError::query)?)?
        }
        Command::ListSchemas => {
            let driver = engine.driver(session_id).await?;
            to_value(driver.list_schemas().await.map_err(SessionError::query)?)?
        }
        Command::ListTableColumns => {
            let (driver, table) = table_target(state, session_id, args).await?;
            to_value(driver.list_table_columns(&table).await.map_err(SessionError::query)?)?
        }
        Command::ListTableIndexes => {
            let (driver, table) = table_target(state, session_id, args).await?;
            to_value(driver.list_table_indexes(&table).await.map_err(SessionError::query)?)?
        }
        Command::ListTableTriggers => {
            let (driver, table) = table_target(state, session_id, args).await?;
            to_value(driver.list_table_triggers(&table).await.map_err(SessionError::query)?)?
        }
        Command::GetTableKeys => {
            let (driver, table) = table_target(state, session_id, args).await?;
            to_value(driver.get_table_keys(&table).await.map_err(SessionError::query)?)?
        }
        Command::GetTableProperties => {
            let (driver, table) = table_target(state, session_id, args).await?;
            to_value(driver.get_table_properties(&table).await.map_err(SessionError::query)?)?
        }
        Command::GetTableCreateScript => {
            let (driver, table) = table_target(state, session_id, args).await?;
            Value::String(
                driver
                    .get_table_create_script(&table)
                    .await
                    .map_err(SessionError::query)?,
            )
        }
        Command::SelectTop => {
            let request: TablePageRequest = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            to_value(driver.select_top(&request).await.map_err(SessionError::query)?)?
        }
        Command::CreateTable => {
            let args: CreateTableArgs = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            let spec = TableSpec {
                table: args.table.clone(),
                columns: args.into_columns(),
            };
            driver.create_table(&spec).await.map_err(SessionError::query)?;
            to_value(&spec.table)?
        }
        Command::AlterTable => {
            let args: AlterTableArgs = args::parse(args)?;
            let driver = engine.driver(session_id).await?;
            driver
                .alter_table(&args.table, &args.alter_spec)
                .await
                .map_err(SessionError::query)?;
            to_value(&args.table)?
        }
        Command::DropElement => {
            let (driver, table) = table_target(state, session_id, args).await?;
            driver.drop_table(&table).await.map_err(SessionError::query)?;
            to_value(&table)?
        }
    };

    Ok(value)
}

async fn transaction(
    state: &AppState,
    session_id: &str,
    args: Value,
    step: TransactionStep,
) -> Result<Value, ServerError> {
    let args: TabArgs = args::parse(args)?;
    state.engine.transaction(session_id, args.tab_id, step).await?;
    Ok(json!({ "tab_id": args.tab_id }))
}

async fn table_target(
    state: &AppState,
    session_id: &str,
    args: Value,
) -> Result<(Arc<dyn DatabaseDriver>, TableRef), ServerError> {
    let table: TableRef = args::parse(args)?;
    let driver = state.engine.driver(session_id).await?;
    Ok((driver, table))
}

fn login_response(state: &AppState, user: Identity) -> Result<Value, ServerError> {
    let token = state.identity.issue(&user)?;
    to_value(LoginResponse { user, token })
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ServerError> {
    serde_json::to_value(value).map_err(|e| ServerError::Internal(e.to_string()))
}
