//! Request/response command dispatch

use std::sync::Arc;

use apiary_core::{Command, Envelope, HttpMethod, LoginResponse};
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::bridge::EventBridge;
use crate::error::ClientError;
use crate::token::TokenStore;

/// Sends catalog commands to an apiary server over HTTP
///
/// Owns the [`EventBridge`] for the same server; both share one token. A
/// 401 on any call clears the token and emits a local `auth:error` event.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    tokens: Arc<TokenStore>,
    events: EventBridge,
}

impl ApiClient {
    /// Client for the server at `base_url` (e.g. `http://127.0.0.1:3000`)
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(format!(
                "{} is not an http(s) url",
                base_url
            )));
        }

        let tokens = Arc::new(TokenStore::new());
        let events = EventBridge::new(event_url(&base)?, tokens.clone());

        Ok(Self {
            http: reqwest::Client::new(),
            base,
            tokens,
            events,
        })
    }

    /// The event bridge for this server
    pub fn events(&self) -> &EventBridge {
        &self.events
    }

    pub fn token(&self) -> Option<String> {
        self.tokens.get()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        self.tokens.set(token);
    }

    pub fn clear_token(&self) {
        self.tokens.clear();
    }

    /// Session id the server will use for this client (the token's user id)
    pub fn session_id(&self) -> Option<String> {
        self.tokens.subject()
    }

    /// Log in and keep the issued token
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let data = self
            .send("auth/login", json!({"username": username, "password": password}))
            .await?;
        self.accept_login(data).await
    }

    /// Register a new user and keep the issued token
    pub async fn register(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
    ) -> Result<LoginResponse, ClientError> {
        let data = self
            .send(
                "auth/register",
                json!({"username": username, "email": email, "password": password}),
            )
            .await?;
        self.accept_login(data).await
    }

    /// End the server session and forget the token
    pub async fn logout(&self) -> Result<(), ClientError> {
        let result = self.send("auth/logout", Value::Null).await;
        self.tokens.clear();
        result.map(|_| ())
    }

    /// Send a catalog command and return its `data`
    ///
    /// Unknown commands and missing path arguments fail before anything is
    /// sent. Failure envelopes surface as [`ClientError::Remote`] with the
    /// server's message, code and trace.
    pub async fn send(&self, name: &str, args: Value) -> Result<Value, ClientError> {
        let command = Command::from_name(name)?;
        let resolved = command.resolve(&args)?;

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push("api")
            .extend(&resolved.segments);

        let method = match resolved.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.http.request(method, url);
        request = if resolved.method.uses_query_string() {
            request.query(&query_pairs(&resolved.args))
        } else {
            request.json(&Value::Object(resolved.args))
        };
        if command.requires_auth() {
            if let Some(token) = self.tokens.get() {
                request = request.bearer_auth(token);
            }
        }

        debug!(command = name, "Sending command");
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        let envelope = serde_json::from_slice::<Envelope>(&body).ok();

        if status == StatusCode::UNAUTHORIZED {
            return Err(self.unauthorized(envelope));
        }

        let Some(envelope) = envelope else {
            return Err(ClientError::Remote {
                message: format!("{} returned {} without an envelope", command, status),
                code: None,
                stack: None,
                status: status.as_u16(),
            });
        };

        envelope.into_result().map_err(|failure| ClientError::Remote {
            message: failure.message,
            code: failure.code,
            stack: failure.stack,
            status: status.as_u16(),
        })
    }

    async fn accept_login(&self, data: Value) -> Result<LoginResponse, ClientError> {
        let login: LoginResponse = serde_json::from_value(data)?;
        self.tokens.set(login.token.clone());
        info!(user_id = %login.user.user_id, "Logged in");

        if let Err(e) = self.events.reconnect_if_listening().await {
            warn!(error = %e, "Event channel did not open after login");
        }
        Ok(login)
    }

    fn unauthorized(&self, envelope: Option<Envelope>) -> ClientError {
        let (message, code) = match envelope {
            Some(envelope) => (
                envelope.error.unwrap_or_else(|| "Unauthorized".to_string()),
                envelope.code,
            ),
            None => ("Unauthorized".to_string(), None),
        };

        self.tokens.clear();
        self.events.emit_local(json!({
            "type": "auth:error",
            "error": "Unauthorized",
            "message": message,
            "code": code,
        }));
        ClientError::Unauthorized { message, code }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("logged_in", &self.tokens.get().is_some())
            .finish()
    }
}

/// `ws(s)://host/ws` for an `http(s)://host` base
fn event_url(base: &Url) -> Result<Url, ClientError> {
    let mut url = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push("ws");
    url.set_query(None);
    Ok(url)
}

/// Query string form of leftover arguments; strings go verbatim
fn query_pairs(args: &Map<String, Value>) -> Vec<(String, String)> {
    args.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
