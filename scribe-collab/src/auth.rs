//! Accounts, password hashing and bearer tokens.
//!
//! [`AccountStore`] is the server-side authority: it registers users, checks
//! passwords with bcrypt and issues opaque tokens with a fixed lifetime.
//! Clients reach it through the [`AuthBackend`] trait so the session manager
//! does not care whether the backend is in-process or behind HTTP.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{env_var, ConfigError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// An authenticated session as handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: Uuid,
    pub username: String,
    pub expires_at: SystemTime,
}

/// Who a valid token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("username {0:?} is already taken")]
    UsernameTaken(String),

    #[error("username and password must not be empty")]
    EmptyCredentials,

    #[error("authentication required")]
    Unauthenticated,

    #[error("token expired")]
    Expired,

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Login/logout endpoint consumed by the session manager.
pub trait AuthBackend: Send + Sync {
    fn login<'a>(&'a self, credentials: &'a Credentials)
        -> BoxFuture<'a, Result<Session, AuthError>>;

    fn logout<'a>(&'a self, token: &'a str) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Lifetime of an issued token.
    pub token_ttl: Duration,
    /// bcrypt work factor (4..=31).
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(24 * 60 * 60),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl AuthConfig {
    /// Defaults overridden by `SCRIBE_TOKEN_TTL_SECS` and `SCRIBE_BCRYPT_COST`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = env_var::<u64>("SCRIBE_TOKEN_TTL_SECS")? {
            config.token_ttl = Duration::from_secs(secs);
        }
        if let Some(cost) = env_var::<u32>("SCRIBE_BCRYPT_COST")? {
            config.bcrypt_cost = cost;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct Account {
    user_id: Uuid,
    username: String,
    password_hash: String,
}

#[derive(Debug, Clone)]
struct TokenRecord {
    identity: Identity,
    expires: Instant,
}

pub struct AccountStore {
    config: AuthConfig,
    accounts: RwLock<HashMap<String, Account>>,
    tokens: RwLock<HashMap<String, TokenRecord>>,
}

impl AccountStore {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            accounts: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Create an account and log it in.
    pub async fn register(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        if credentials.username.trim().is_empty() || credentials.password.is_empty() {
            return Err(AuthError::EmptyCredentials);
        }
        if self.accounts.read().await.contains_key(&credentials.username) {
            return Err(AuthError::UsernameTaken(credentials.username.clone()));
        }

        let password = credentials.password.clone();
        let cost = self.config.bcrypt_cost;
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .map_err(|e| AuthError::Hashing(e.to_string()))?;

        let account = Account {
            user_id: Uuid::new_v4(),
            username: credentials.username.clone(),
            password_hash,
        };
        {
            let mut accounts = self.accounts.write().await;
            // Lost a race against a concurrent registration.
            if accounts.contains_key(&account.username) {
                return Err(AuthError::UsernameTaken(account.username));
            }
            accounts.insert(account.username.clone(), account.clone());
        }

        log::info!("Registered account {} ({})", account.username, account.user_id);
        Ok(self.issue(account.user_id, account.username).await)
    }

    /// Check a password and issue a fresh token.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let account = self
            .accounts
            .read()
            .await
            .get(&credentials.username)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;

        let password = credentials.password.clone();
        let hash = account.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .map_err(|e| AuthError::Hashing(e.to_string()))?;

        if !verified {
            log::warn!("Failed login for {}", credentials.username);
            return Err(AuthError::InvalidCredentials);
        }
        Ok(self.issue(account.user_id, account.username).await)
    }

    /// Resolve a bearer token. Expired tokens are dropped on first sight.
    pub async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        {
            let tokens = self.tokens.read().await;
            match tokens.get(token) {
                None => return Err(AuthError::Unauthenticated),
                Some(record) if record.expires > Instant::now() => {
                    return Ok(record.identity.clone());
                }
                Some(_) => {}
            }
        }
        self.tokens.write().await.remove(token);
        Err(AuthError::Expired)
    }

    pub async fn revoke_token(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token).is_some()
    }

    /// Invalidate every token held by `user_id`. Returns how many were dropped.
    pub async fn revoke_user(&self, user_id: Uuid) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.identity.user_id != user_id);
        before - tokens.len()
    }

    pub async fn user_id(&self, username: &str) -> Option<Uuid> {
        self.accounts.read().await.get(username).map(|a| a.user_id)
    }

    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    /// Issued tokens still held, expired ones not yet purged included.
    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }

    async fn issue(&self, user_id: Uuid, username: String) -> Session {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let ttl = self.config.token_ttl;
        let identity = Identity {
            user_id,
            username: username.clone(),
        };
        let now = Instant::now();
        {
            let mut tokens = self.tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, record| record.expires > now);
            if tokens.len() < before {
                log::debug!("Purged {} expired tokens", before - tokens.len());
            }
            tokens.insert(
                token.clone(),
                TokenRecord {
                    identity,
                    expires: now + ttl,
                },
            );
        }
        Session {
            token,
            user_id,
            username,
            expires_at: SystemTime::now() + ttl,
        }
    }
}

impl AuthBackend for AccountStore {
    fn login<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Session, AuthError>> {
        Box::pin(self.authenticate(credentials))
    }

    fn logout<'a>(&'a self, token: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.revoke_token(token).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AccountStore {
        AccountStore::new(AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        })
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let store = store();
        let creds = Credentials::new("alice", "s3cret");
        let registered = store.register(&creds).await.unwrap();
        let session = store.authenticate(&creds).await.unwrap();

        assert_eq!(registered.user_id, session.user_id);
        assert_ne!(registered.token, session.token);
        assert_eq!(store.validate(&session.token).await.unwrap().username, "alice");
        assert_eq!(store.user_id("alice").await, Some(session.user_id));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let store = store();
        store.register(&Credentials::new("bob", "right")).await.unwrap();
        assert_eq!(
            store.authenticate(&Credentials::new("bob", "wrong")).await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            store.authenticate(&Credentials::new("nobody", "x")).await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_usernames() {
        let store = store();
        store.register(&Credentials::new("carol", "pw")).await.unwrap();
        assert!(matches!(
            store.register(&Credentials::new("carol", "other")).await,
            Err(AuthError::UsernameTaken(_))
        ));
        assert_eq!(
            store.register(&Credentials::new("  ", "pw")).await,
            Err(AuthError::EmptyCredentials)
        );
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn test_token_expiry() {
        let store = AccountStore::new(AuthConfig {
            token_ttl: Duration::from_millis(20),
            bcrypt_cost: 4,
        });
        let session = store.register(&Credentials::new("dave", "pw")).await.unwrap();
        assert!(store.validate(&session.token).await.is_ok());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.validate(&session.token).await, Err(AuthError::Expired));
        assert_eq!(
            store.validate(&session.token).await,
            Err(AuthError::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn test_expired_tokens_purged_on_issue() {
        let store = AccountStore::new(AuthConfig {
            token_ttl: Duration::from_millis(300),
            bcrypt_cost: 4,
        });
        let creds = Credentials::new("gina", "pw");
        store.register(&creds).await.unwrap();
        for _ in 0..3 {
            store.authenticate(&creds).await.unwrap();
        }
        assert_eq!(store.token_count().await, 4);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let fresh = store.authenticate(&creds).await.unwrap();
        assert_eq!(store.token_count().await, 1);
        assert!(store.validate(&fresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_revocation() {
        let store = store();
        let creds = Credentials::new("erin", "pw");
        let first = store.register(&creds).await.unwrap();
        let second = store.authenticate(&creds).await.unwrap();

        assert!(store.revoke_token(&first.token).await);
        assert!(!store.revoke_token(&first.token).await);
        assert_eq!(store.revoke_user(second.user_id).await, 1);
        assert_eq!(
            store.validate(&second.token).await,
            Err(AuthError::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn test_backend_trait_logout_revokes() {
        let store = store();
        let creds = Credentials::new("frank", "pw");
        store.register(&creds).await.unwrap();

        let backend: &dyn AuthBackend = &store;
        let session = backend.login(&creds).await.unwrap();
        backend.logout(&session.token).await;
        assert!(store.validate(&session.token).await.is_err());
    }
}
