//! User credential storage

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::AuthError;
use super::identity::Identity;

/// Minimum accepted password length for registration
pub const MIN_PASSWORD_LEN: usize = 6;

/// Lookup and registration of username/password credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Check a username/password pair
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError>;

    /// Register a new user
    async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<String>,
    ) -> Result<Identity, AuthError>;
}

struct StoredUser {
    identity: Identity,
    salt: String,
    password_hash: String,
}

/// In-memory credential store, seeded with a single `admin` user
pub struct MemoryCredentialStore {
    users: RwLock<HashMap<String, StoredUser>>,
}

impl MemoryCredentialStore {
    /// Create a store holding only the default `admin`/`admin` account
    pub fn new() -> Self {
        let mut users = HashMap::new();
        users.insert(
            "admin".to_string(),
            stored(Identity::new("1", "admin"), "admin"),
        );
        Self {
            users: RwLock::new(users),
        }
    }

    /// Create a store with no users
    pub fn empty() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Number of registered users
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stored(identity: Identity, password: &str) -> StoredUser {
    let salt = Uuid::new_v4().simple().to_string();
    let password_hash = hash_password(&salt, password);
    StoredUser {
        identity,
        salt,
        password_hash,
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let users = self.users.read().await;
        let user = users.get(username).ok_or(AuthError::InvalidCredentials)?;
        if hash_password(&user.salt, password) != user.password_hash {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user.identity.clone())
    }

    async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<String>,
    ) -> Result<Identity, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN));
        }

        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(AuthError::UserExists);
        }

        let mut identity = Identity::new(Uuid::now_v7().to_string(), username);
        identity.email = email;
        users.insert(username.to_string(), stored(identity.clone(), password));
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_admin_can_authenticate() {
        let store = MemoryCredentialStore::new();
        let identity = store.authenticate("admin", "admin").await.unwrap();

        assert_eq!(identity.user_id, "1");
        assert_eq!(identity.username, "admin");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let store = MemoryCredentialStore::new();
        let err = store.authenticate("admin", "nope").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let store = MemoryCredentialStore::new();
        let err = store.authenticate("mallory", "whatever").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let store = MemoryCredentialStore::new();
        let registered = store
            .register("dave", "hunter22", Some("dave@example.com".to_string()))
            .await
            .unwrap();

        let identity = store.authenticate("dave", "hunter22").await.unwrap();
        assert_eq!(identity, registered);
        assert_ne!(identity.user_id, "1");
        assert_eq!(store.user_count().await, 2);
    }

    #[tokio::test]
    async fn register_rejects_short_password() {
        let store = MemoryCredentialStore::new();
        let err = store.register("erin", "abc", None).await.unwrap_err();
        assert_eq!(err, AuthError::WeakPassword(MIN_PASSWORD_LEN));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_username() {
        let store = MemoryCredentialStore::new();
        let err = store.register("admin", "password", None).await.unwrap_err();
        assert_eq!(err, AuthError::UserExists);
    }

    #[tokio::test]
    async fn same_password_hashes_differently_per_user() {
        let store = MemoryCredentialStore::empty();
        store.register("a", "samepass", None).await.unwrap();
        store.register("b", "samepass", None).await.unwrap();

        let users = store.users.read().await;
        assert_ne!(users["a"].password_hash, users["b"].password_hash);
    }
}
