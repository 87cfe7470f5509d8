//! HTTP entry point for catalog commands

use std::collections::HashMap;
use std::sync::Arc;

use apiary_core::{Command, Envelope, Identity};
use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
};
use serde_json::{Map, Value};

use crate::{AppState, ServerError, commands};

/// Run `command` with arguments gathered from the whole request
pub async fn handle(
    command: Command,
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<Identity>>,
    path: Option<Path<HashMap<String, String>>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<Envelope>, ServerError> {
    let path = path.map(|Path(params)| params).unwrap_or_default();
    let args = merge_args(&body, query, path)?;
    let identity = identity.map(|Extension(identity)| identity);

    let data = commands::execute(&state, identity.as_ref(), command, args).await?;
    Ok(Json(Envelope::ok(data)))
}

/// Body fields first, then query string fields that the body left unset;
/// path parameters always win.
fn merge_args(
    body: &[u8],
    query: HashMap<String, String>,
    path: HashMap<String, String>,
) -> Result<Value, ServerError> {
    let mut args = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(_) => {
                return Err(ServerError::InvalidMessage(
                    "request body must be a JSON object".to_string(),
                ));
            }
            Err(e) => return Err(ServerError::InvalidMessage(e.to_string())),
        }
    };

    for (key, value) in query {
        args.entry(key).or_insert(Value::String(value));
    }
    for (key, value) in path {
        args.insert(key, Value::String(value));
    }

    Ok(Value::Object(args))
}
