//! Configuration for identity token signing

use serde::{Deserialize, Serialize};

/// Well-known fallback secret; running with it is allowed but warned about
pub const DEFAULT_SIGNING_SECRET: &str = "apiary-development-secret-change-me";

/// Configuration for the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// HMAC secret used to sign identity tokens
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Token lifetime in seconds
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,

    /// Clock skew leeway in seconds for token expiry validation
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
}

fn default_secret() -> String {
    DEFAULT_SIGNING_SECRET.to_string()
}

fn default_token_lifetime() -> u64 {
    7 * 24 * 60 * 60
}

fn default_clock_skew() -> u64 {
    60
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            token_lifetime_secs: default_token_lifetime(),
            clock_skew_secs: default_clock_skew(),
        }
    }
}

impl IdentityConfig {
    /// Create a config with an explicit signing secret and default lifetime
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Override the token lifetime
    pub fn with_lifetime_secs(mut self, secs: u64) -> Self {
        self.token_lifetime_secs = secs;
        self
    }

    /// Whether the well-known fallback secret is in use
    pub fn uses_default_secret(&self) -> bool {
        self.secret == DEFAULT_SIGNING_SECRET || self.secret.is_empty()
    }
}
