//! Client-side session manager.
//!
//! A [`SessionContext`] is the single writer of the process's authentication
//! state. Every other component (channels, permission caches) holds a clone and
//! only reads: either a [`SessionSnapshot`] per connection attempt, or a
//! `watch` subscription to react to logout.
//!
//! Each transition bumps `generation`. Anything that captured a generation at
//! open time can tell synchronously whether it is still running under the
//! session it was created for.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::auth::{AuthBackend, AuthError, Credentials, Session};

/// Why the last session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// `logout()` was called.
    Requested,
    /// Some authenticated call reported an invalid or expired token.
    Expired,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub session: Option<Session>,
    pub last_logout: Option<LogoutReason>,
}

impl SessionSnapshot {
    pub fn token(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.token.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }
}

struct SessionInner {
    backend: Arc<dyn AuthBackend>,
    state: watch::Sender<SessionSnapshot>,
}

/// Shared handle to the process-wide session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl SessionContext {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(SessionInner { backend, state }),
        }
    }

    /// Log in, replacing any current session.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let session = self.inner.backend.login(credentials).await?;
        self.inner.state.send_modify(|state| {
            state.generation += 1;
            state.session = Some(session.clone());
            state.last_logout = None;
        });
        log::info!("Logged in as {} ({})", session.username, session.user_id);
        Ok(session)
    }

    /// End the session. Subscribers observe the transition before the backend
    /// is notified.
    pub async fn logout(&self) {
        if let Some(previous) = self.end(LogoutReason::Requested, None) {
            log::info!("Logged out {}", previous.username);
            self.inner.backend.logout(&previous.token).await;
        }
    }

    /// Report an authentication failure for `token`.
    ///
    /// Only the current token can end the session; a late failure for a token
    /// that was already replaced is ignored. Returns whether a logout happened.
    pub fn expire(&self, token: &str) -> bool {
        let ended = self.end(LogoutReason::Expired, Some(token));
        if let Some(previous) = &ended {
            log::warn!("Session for {} expired; logging out", previous.username);
        }
        ended.is_some()
    }

    pub fn current_token(&self) -> Option<String> {
        self.inner.state.borrow().session.as_ref().map(|s| s.token.clone())
    }

    pub fn identity(&self) -> Option<Uuid> {
        self.inner.state.borrow().session.as_ref().map(|s| s.user_id)
    }

    pub fn username(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .session
            .as_ref()
            .map(|s| s.username.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_active()
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.borrow().generation
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Receive every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    fn end(&self, reason: LogoutReason, only_token: Option<&str>) -> Option<Session> {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            let matches = match (&state.session, only_token) {
                (Some(_), None) => true,
                (Some(current), Some(token)) => current.token == token,
                (None, _) => false,
            };
            if !matches {
                return false;
            }
            previous = state.session.take();
            state.generation += 1;
            state.last_logout = Some(reason);
            true
        });
        previous
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("SessionContext")
            .field("generation", &state.generation)
            .field("user", &state.session.as_ref().map(|s| &s.username))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccountStore, AuthConfig};

    async fn context_with_user(name: &str) -> (SessionContext, Credentials, Arc<AccountStore>) {
        let store = Arc::new(AccountStore::new(AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        }));
        let creds = Credentials::new(name, "pw");
        store.register(&creds).await.unwrap();
        (SessionContext::new(store.clone()), creds, store)
    }

    #[tokio::test]
    async fn test_login_sets_token() {
        let (ctx, creds, store) = context_with_user("alice").await;
        assert!(ctx.current_token().is_none());

        let session = ctx.login(&creds).await.unwrap();
        assert_eq!(ctx.current_token(), Some(session.token.clone()));
        assert_eq!(ctx.identity(), Some(session.user_id));
        assert_eq!(ctx.username().as_deref(), Some("alice"));
        assert_eq!(ctx.generation(), 1);
        assert!(store.validate(&session.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_login_keeps_state() {
        let (ctx, _, _) = context_with_user("bob").await;
        let err = ctx.login(&Credentials::new("bob", "nope")).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.generation(), 0);
    }

    #[tokio::test]
    async fn test_logout_notifies_subscribers_and_revokes() {
        let (ctx, creds, store) = context_with_user("carol").await;
        let session = ctx.login(&creds).await.unwrap();
        let mut rx = ctx.subscribe();

        ctx.logout().await;
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert!(!snapshot.is_active());
        assert_eq!(snapshot.last_logout, Some(LogoutReason::Requested));
        assert!(ctx.current_token().is_none());
        assert!(store.validate(&session.token).await.is_err());
    }

    #[tokio::test]
    async fn test_expire_only_for_current_token() {
        let (ctx, creds, _) = context_with_user("dave").await;
        let first = ctx.login(&creds).await.unwrap();
        let second = ctx.login(&creds).await.unwrap();

        assert!(!ctx.expire(&first.token));
        assert!(ctx.is_authenticated());

        assert!(ctx.expire(&second.token));
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.snapshot().last_logout, Some(LogoutReason::Expired));
        assert!(!ctx.expire(&second.token));
    }

    #[tokio::test]
    async fn test_logout_when_logged_out_is_noop() {
        let (ctx, _, _) = context_with_user("erin").await;
        ctx.logout().await;
        assert_eq!(ctx.generation(), 0);
    }
}
