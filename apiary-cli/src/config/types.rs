use apiary_core::{IdentityConfig, SessionPolicy};
use apiary_server::ServerConfig;
use serde::Deserialize;

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawApiaryConfig {
    #[serde(default)]
    pub server: RawServerSection,

    #[serde(default)]
    pub identity: RawIdentitySection,

    #[serde(default)]
    pub session: RawSessionSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawServerSection {
    /// Host to bind to
    pub host: Option<String>,

    /// Port for the apiary server
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawIdentitySection {
    /// Token signing secret
    pub secret: Option<String>,

    pub token_lifetime_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSessionSection {
    pub max_session_age_secs: Option<u64>,

    pub reap_interval_secs: Option<u64>,

    /// Idle time before a reserved tab is rolled back
    pub transaction_timeout_secs: Option<u64>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Default)]
pub struct ApiaryConfig {
    pub server: ServerConfig,
}

impl ApiaryConfig {
    pub(super) fn from_raw(raw: RawApiaryConfig) -> Self {
        let defaults = ServerConfig::default();
        let identity_defaults = IdentityConfig::default();
        let session_defaults = SessionPolicy::default();

        let identity = IdentityConfig {
            secret: raw.identity.secret.unwrap_or(identity_defaults.secret),
            token_lifetime_secs: raw
                .identity
                .token_lifetime_secs
                .unwrap_or(identity_defaults.token_lifetime_secs),
            ..identity_defaults
        };

        let session = SessionPolicy {
            max_session_age_secs: raw
                .session
                .max_session_age_secs
                .unwrap_or(session_defaults.max_session_age_secs),
            reap_interval_secs: raw
                .session
                .reap_interval_secs
                .unwrap_or(session_defaults.reap_interval_secs),
            transaction_timeout_secs: raw
                .session
                .transaction_timeout_secs
                .unwrap_or(session_defaults.transaction_timeout_secs),
            ..session_defaults
        };

        Self {
            server: ServerConfig::new(
                raw.server.host.unwrap_or(defaults.host),
                raw.server.port.unwrap_or(defaults.port),
            )
            .with_identity(identity)
            .with_session_policy(session),
        }
    }

    /// Base URL a local client uses to reach this server
    pub fn base_url(&self) -> String {
        let host = match self.server.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        };
        if host.contains(':') {
            format!("http://[{}]:{}", host, self.server.port)
        } else {
            format!("http://{}:{}", host, self.server.port)
        }
    }
}
