//! Signed identity token issuing and verification

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::IdentityConfig;
use super::error::AuthError;
use super::identity::Identity;

/// Claims carried in an identity token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    id: String,
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    iat: i64,
    exp: i64,
}

/// Issues and verifies HS256 identity tokens
///
/// Verification needs no server-side state: the token alone yields the
/// identity and, through [`IdentityProvider::session_id_for`], the session id.
#[derive(Clone)]
pub struct IdentityProvider {
    config: IdentityConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("token_lifetime_secs", &self.config.token_lifetime_secs)
            .field("uses_default_secret", &self.config.uses_default_secret())
            .finish()
    }
}

impl IdentityProvider {
    /// Create a provider from config
    pub fn new(config: IdentityConfig) -> Self {
        let secret = config.secret.as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            config,
        }
    }

    /// Get the config
    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Issue a token for `identity` using the configured lifetime
    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        let lifetime_secs = self.config.token_lifetime_secs;
        let expires_at = i64::try_from(lifetime_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::Signing(format!("token lifetime of {lifetime_secs}s is out of range"))
            })?;
        self.issue_with_expiry(identity, expires_at)
    }

    /// Issue a token that expires at `expires_at`
    pub fn issue_with_expiry(
        &self,
        identity: &Identity,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            id: identity.user_id.clone(),
            username: identity.username.clone(),
            email: identity.email.clone(),
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a token and return the identity it carries
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.clock_skew_secs;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(error = %e, "Identity token rejected");
            AuthError::from(e)
        })?;

        Ok(identity_from_claims(data.claims))
    }

    /// Whether a verified identity's token has run out since, within the clock skew
    pub fn is_expired(&self, identity: &Identity) -> bool {
        identity.expires_at.is_some_and(|expires_at| {
            expires_at
                .timestamp()
                .saturating_add_unsigned(self.config.clock_skew_secs)
                < Utc::now().timestamp()
        })
    }

    /// User id of a token whose signature verifies but which is otherwise rejected
    ///
    /// Returns `None` for forged or malformed tokens, which carry no trustworthy
    /// subject.
    pub fn subject_of_rejected(&self, token: &str) -> Option<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims::<&str>(&[]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .ok()
            .map(|data| data.claims.id)
    }

    /// Session id for an identity: one logical session per user
    pub fn session_id_for(identity: &Identity) -> String {
        identity.user_id.clone()
    }
}

fn identity_from_claims(claims: Claims) -> Identity {
    Identity {
        user_id: claims.id,
        username: claims.username,
        email: claims.email,
        expires_at: DateTime::from_timestamp(claims.exp, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> IdentityProvider {
        IdentityProvider::new(IdentityConfig::with_secret("test-secret"))
    }

    #[test]
    fn issue_then_verify_returns_identity() {
        let provider = provider();
        let identity = Identity::new("7", "carol").with_email("carol@example.com");

        let token = provider.issue(&identity).unwrap();
        let verified = provider.verify(&token).unwrap();

        assert_eq!(verified.user_id, "7");
        assert_eq!(verified.username, "carol");
        assert_eq!(verified.email.as_deref(), Some("carol@example.com"));
        assert!(verified.expires_at.is_some());
    }

    #[test]
    fn session_id_is_stable_across_tokens() {
        let provider = provider();
        let identity = Identity::new("7", "carol");

        let a = provider.verify(&provider.issue(&identity).unwrap()).unwrap();
        let b = provider.verify(&provider.issue(&identity).unwrap()).unwrap();

        assert_eq!(
            IdentityProvider::session_id_for(&a),
            IdentityProvider::session_id_for(&b)
        );
        assert_eq!(IdentityProvider::session_id_for(&a), "7");
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let provider = provider();
        let identity = Identity::new("7", "carol");
        let token = provider
            .issue_with_expiry(&identity, Utc::now() - chrono::Duration::hours(2))
            .unwrap();

        assert_eq!(provider.verify(&token), Err(AuthError::Expired));
        assert_eq!(provider.subject_of_rejected(&token).as_deref(), Some("7"));
    }

    #[test]
    fn token_signed_with_other_secret_is_invalid() {
        let other = IdentityProvider::new(IdentityConfig::with_secret("other-secret"));
        let token = other.issue(&Identity::new("7", "carol")).unwrap();

        let err = provider().verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
        assert_eq!(provider().subject_of_rejected(&token), None);
    }

    #[test]
    fn garbage_token_is_invalid() {
        let err = provider().verify("not-a-token").unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn out_of_range_lifetime_fails_to_issue() {
        let provider = IdentityProvider::new(
            IdentityConfig::with_secret("test-secret").with_lifetime_secs(u64::MAX),
        );
        let err = provider.issue(&Identity::new("7", "carol")).unwrap_err();
        assert!(matches!(err, AuthError::Signing(_)));

        let provider = IdentityProvider::new(
            IdentityConfig::with_secret("test-secret").with_lifetime_secs(i64::MAX as u64),
        );
        assert!(matches!(
            provider.issue(&Identity::new("7", "carol")),
            Err(AuthError::Signing(_))
        ));
    }

    #[test]
    fn is_expired_allows_clock_skew() {
        let provider = provider();
        let at = |offset_secs: i64| {
            let mut identity = Identity::new("7", "carol");
            identity.expires_at = Some(Utc::now() + chrono::Duration::seconds(offset_secs));
            identity
        };

        assert!(!provider.is_expired(&Identity::new("7", "carol")));
        assert!(!provider.is_expired(&at(3600)));
        assert!(!provider.is_expired(&at(-10)));
        assert!(provider.is_expired(&at(-3600)));
    }
}
