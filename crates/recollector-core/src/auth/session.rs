//! Session state and its transitions.
//!
//! [`SessionState`] is a plain value; its `hydrate`/`on_*` constructors are the
//! only way to produce a new one. [`Session`] owns the live state, applies
//! transitions under a lock and writes each result through to the
//! [`KeyValueStore`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::codec::{Credential, TokenError};
use super::renewal::RenewalError;
use super::store::{KeyValueStore, StoreKey};
use crate::clock::Clock;

/// Why the session last fell back to anonymous.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionErrorKind {
    #[error("Token could not be decoded: {0}")]
    MalformedToken(TokenError),

    #[error("Stored token could not be decoded: {0}")]
    TokenDecode(TokenError),

    #[error("Token is already expired")]
    TokenExpired,

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Session renewal failed: {0}")]
    Renewal(RenewalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Anonymous,
    /// Holds a credential. Expiry is a derived read and does not leave this phase.
    Authenticated,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    credential: Option<Credential>,
    refresh_token: Option<String>,
    last_error: Option<SessionErrorKind>,
}

impl SessionState {
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn failed(error: SessionErrorKind) -> Self {
        Self {
            last_error: Some(error),
            ..Self::default()
        }
    }

    fn authenticated(credential: Credential, refresh_token: Option<String>) -> Self {
        Self {
            credential: Some(credential),
            refresh_token,
            last_error: None,
        }
    }

    /// Rebuild state from a stored token.
    ///
    /// A stored token that decodes but has expired is kept: the session is not
    /// authenticated, but the credential is still there to be renewed.
    pub fn hydrate(stored: Option<&str>, now: DateTime<Utc>) -> Self {
        let raw = match stored.map(str::trim) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Self::anonymous(),
        };

        match Credential::decode(raw) {
            Ok(credential) => {
                debug!(
                    subject = %credential.subject(),
                    expired = credential.is_expired(now),
                    "Hydrated session from store"
                );
                Self::authenticated(credential, None)
            }
            Err(e) => Self::failed(SessionErrorKind::TokenDecode(e)),
        }
    }

    pub fn on_login_succeeded(raw_token: &str, now: DateTime<Utc>) -> Self {
        match Credential::decode(raw_token) {
            Ok(credential) if credential.is_expired(now) => {
                Self::failed(SessionErrorKind::TokenExpired)
            }
            Ok(credential) => Self::authenticated(credential, None),
            Err(e) => Self::failed(SessionErrorKind::MalformedToken(e)),
        }
    }

    /// Same contract as login. The refresh token carries over unless replaced.
    pub fn on_renewed(&self, raw_token: &str, now: DateTime<Utc>) -> Self {
        let next = Self::on_login_succeeded(raw_token, now);
        if next.credential.is_some() {
            next.with_refresh_token(self.refresh_token.clone())
        } else {
            next
        }
    }

    pub fn on_login_failed(reason: impl Into<String>) -> Self {
        Self::failed(SessionErrorKind::LoginRejected(reason.into()))
    }

    pub fn on_renewal_failed(error: RenewalError) -> Self {
        Self::failed(SessionErrorKind::Renewal(error))
    }

    pub fn on_logged_out() -> Self {
        Self::anonymous()
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        if self.credential.is_some() {
            self.refresh_token = refresh_token.filter(|t| !t.is_empty());
        }
        self
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn last_error(&self) -> Option<&SessionErrorKind> {
        self.last_error.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        if self.credential.is_some() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Anonymous
        }
    }

    pub fn is_authenticated(&self, now: DateTime<Utc>) -> bool {
        self.credential
            .as_ref()
            .map(|c| !c.is_expired(now))
            .unwrap_or(false)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("credential", &self.credential)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Snapshot for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub subject: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining: Duration,
    pub authenticated: bool,
    pub last_error: Option<String>,
}

impl SessionStatus {
    /// Minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.remaining.num_minutes().max(0)
    }
}

/// The live session shared by the renewal coordinator, the interceptors and
/// the login/logout flows.
pub struct Session {
    state: RwLock<SessionState>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl Session {
    /// Hydrate from the store. Corrupt stored tokens are cleared.
    pub fn load(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let stored = store.get(StoreKey::AccessToken).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read stored token");
            None
        });

        let mut state = SessionState::hydrate(stored.as_deref(), clock.now());
        if state.credential.is_some() {
            let refresh_token = store.get(StoreKey::RefreshToken).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read stored refresh token");
                None
            });
            state = state.with_refresh_token(refresh_token);
        } else if let Some(error) = state.last_error() {
            warn!(error = %error, "Discarding unreadable stored session");
            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to clear session store");
            }
        }

        Self {
            state: RwLock::new(state),
            store,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.state.read().await.credential.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_authenticated(self.now())
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.read().await;
        let now = self.now();
        let credential = state.credential();
        SessionStatus {
            subject: credential.map(|c| c.subject().to_string()),
            expires_at: credential.map(|c| c.expires_at()),
            remaining: credential
                .map(|c| c.remaining(now))
                .unwrap_or_else(Duration::zero),
            authenticated: state.is_authenticated(now),
            last_error: state.last_error().map(|e| e.to_string()),
        }
    }

    pub async fn login_succeeded(
        &self,
        raw_token: &str,
        refresh_token: Option<String>,
    ) -> SessionState {
        let next = SessionState::on_login_succeeded(raw_token, self.now())
            .with_refresh_token(refresh_token);
        match next.credential() {
            Some(c) => info!(subject = %c.subject(), expires_at = %c.expires_at(), "Logged in"),
            None => warn!(error = ?next.last_error(), "Login token rejected"),
        }
        self.apply(next).await
    }

    pub async fn login_failed(&self, reason: impl Into<String>) -> SessionState {
        let next = SessionState::on_login_failed(reason);
        warn!(error = ?next.last_error(), "Login failed");
        self.apply(next).await
    }

    /// Install a renewed token. A `None` refresh token keeps the current one.
    ///
    /// `from_token` is the token the renewal started from. If the session no
    /// longer holds it (logged out or logged in again meanwhile) nothing is
    /// applied and `None` is returned.
    pub async fn renewed(
        &self,
        from_token: &str,
        raw_token: &str,
        refresh_token: Option<String>,
    ) -> Option<SessionState> {
        let now = self.now();
        self.apply_if_current(from_token, |current| {
            let mut next = current.on_renewed(raw_token, now);
            if refresh_token.is_some() {
                next = next.with_refresh_token(refresh_token);
            }
            match next.credential() {
                Some(c) => info!(subject = %c.subject(), expires_at = %c.expires_at(), "Session renewed"),
                None => warn!(error = ?next.last_error(), "Renewed token rejected"),
            }
            next
        })
        .await
    }

    /// Log out after a failed renewal, unless the session has moved on from
    /// `from_token` since the renewal started.
    pub async fn renewal_failed(
        &self,
        from_token: &str,
        error: RenewalError,
    ) -> Option<SessionState> {
        self.apply_if_current(from_token, |_| {
            warn!(error = %error, "Session renewal failed, logging out");
            SessionState::on_renewal_failed(error)
        })
        .await
    }

    pub async fn logged_out(&self) -> SessionState {
        info!("Logged out");
        self.apply(SessionState::on_logged_out()).await
    }

    async fn apply(&self, next: SessionState) -> SessionState {
        let mut guard = self.state.write().await;
        self.persist(&next);
        *guard = next.clone();
        next
    }

    async fn apply_if_current(
        &self,
        from_token: &str,
        transition: impl FnOnce(&SessionState) -> SessionState,
    ) -> Option<SessionState> {
        let mut guard = self.state.write().await;
        if guard.credential().map(Credential::token) != Some(from_token) {
            debug!("Session changed while renewal was in flight, discarding result");
            return None;
        }
        let next = transition(&guard);
        self.persist(&next);
        *guard = next.clone();
        Some(next)
    }

    /// Runs under the state write lock so store writes land in transition
    /// order. The stores are small and local; a slow keyring blocks other
    /// session readers for the duration.
    fn persist(&self, state: &SessionState) {
        let result = match state.credential() {
            Some(credential) => self.write_credential(credential, state.refresh_token()),
            None => self.store.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }

    fn write_credential(
        &self,
        credential: &Credential,
        refresh_token: Option<&str>,
    ) -> anyhow::Result<()> {
        self.store.set(StoreKey::AccessToken, credential.token())?;
        self.store.set(StoreKey::UserEmail, credential.subject())?;
        match refresh_token {
            Some(token) => self.store.set(StoreKey::RefreshToken, token),
            None => self.store.delete(StoreKey::RefreshToken),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryStore;
    use crate::test_support::{at, make_token, ManualClock};

    fn session_with(store: Arc<MemoryStore>, now: i64) -> Session {
        Session::load(store, Arc::new(ManualClock::new(at(now))))
    }

    // -------------------------------------------------------------------------
    // Pure transitions
    // -------------------------------------------------------------------------

    #[test]
    fn test_hydrate_empty_is_anonymous() {
        let now = at(1_000);
        for stored in [None, Some(""), Some("   ")] {
            let state = SessionState::hydrate(stored, now);
            assert_eq!(state.phase(), SessionPhase::Anonymous);
            assert!(!state.is_authenticated(now));
            assert_eq!(state.last_error(), None);
        }
    }

    #[test]
    fn test_hydrate_corrupt_token_records_decode_error() {
        let state = SessionState::hydrate(Some("garbage"), at(1_000));

        assert_eq!(state.phase(), SessionPhase::Anonymous);
        assert!(matches!(state.last_error(), Some(SessionErrorKind::TokenDecode(_))));
    }

    #[test]
    fn test_hydrate_valid_and_expired_tokens() {
        let token = make_token("a@b.com", 2_000);

        let fresh = SessionState::hydrate(Some(&token), at(1_000));
        assert!(fresh.is_authenticated(at(1_000)));

        let stale = SessionState::hydrate(Some(&token), at(3_000));
        assert!(!stale.is_authenticated(at(3_000)));
        // Still holds the credential so it can be renewed
        assert_eq!(stale.phase(), SessionPhase::Authenticated);
    }

    #[test]
    fn test_hydrate_is_idempotent() {
        let token = make_token("a@b.com", 2_000);
        let now = at(1_000);

        let once = SessionState::hydrate(Some(&token), now);
        let serialized = once.credential().map(|c| c.token().to_string());
        let twice = SessionState::hydrate(serialized.as_deref(), now);

        assert_eq!(once.is_authenticated(now), twice.is_authenticated(now));
        assert_eq!(once.credential(), twice.credential());
    }

    #[test]
    fn test_login_rejects_expired_and_malformed_tokens() {
        let now = at(1_000);

        let expired = SessionState::on_login_succeeded(&make_token("a@b.com", 1_000), now);
        assert_eq!(expired.last_error(), Some(&SessionErrorKind::TokenExpired));
        assert_eq!(expired.credential(), None);

        let malformed = SessionState::on_login_succeeded("nope", now);
        assert!(matches!(
            malformed.last_error(),
            Some(SessionErrorKind::MalformedToken(_))
        ));
    }

    #[test]
    fn test_renewed_keeps_refresh_token() {
        let now = at(1_000);
        let current = SessionState::on_login_succeeded(&make_token("a@b.com", 1_500), now)
            .with_refresh_token(Some("rt-1".to_string()));

        let renewed = current.on_renewed(&make_token("a@b.com", 5_000), now);
        assert_eq!(renewed.refresh_token(), Some("rt-1"));
        assert_eq!(renewed.credential().map(|c| c.expires_at()), Some(at(5_000)));
    }

    #[test]
    fn test_refresh_token_requires_credential() {
        let state = SessionState::anonymous().with_refresh_token(Some("rt".to_string()));
        assert_eq!(state.refresh_token(), None);
    }

    #[test]
    fn test_debug_hides_refresh_token() {
        let state = SessionState::on_login_succeeded(&make_token("a@b.com", 1_500), at(1_000))
            .with_refresh_token(Some("super-secret".to_string()));
        assert!(!format!("{:?}", state).contains("super-secret"));
    }

    // -------------------------------------------------------------------------
    // Live session
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_login_writes_through_to_store() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), 1_000);
        let token = make_token("a@b.com", 2_000);

        let state = session
            .login_succeeded(&token, Some("rt-1".to_string()))
            .await;
        assert!(state.is_authenticated(at(1_000)));
        assert!(session.is_authenticated().await);

        assert_eq!(store.get(StoreKey::AccessToken).unwrap(), Some(token));
        assert_eq!(store.get(StoreKey::UserEmail).unwrap().as_deref(), Some("a@b.com"));
        assert_eq!(store.get(StoreKey::RefreshToken).unwrap().as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_login_failure_replaces_previous_session() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), 1_000);
        session.login_succeeded(&make_token("a@b.com", 2_000), None).await;

        let state = session.login_failed("Bad credentials").await;
        assert_eq!(
            state.last_error(),
            Some(&SessionErrorKind::LoginRejected("Bad credentials".to_string()))
        );
        assert!(!session.is_authenticated().await);
        assert_eq!(store.get(StoreKey::AccessToken).unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_restores_refresh_token() {
        let store = Arc::new(MemoryStore::new());
        store.set(StoreKey::AccessToken, &make_token("a@b.com", 2_000)).unwrap();
        store.set(StoreKey::RefreshToken, "rt-9").unwrap();

        let session = session_with(store, 1_000);
        assert_eq!(session.state().await.refresh_token(), Some("rt-9"));
    }

    #[tokio::test]
    async fn test_load_clears_corrupt_store() {
        let store = Arc::new(MemoryStore::new());
        store.set(StoreKey::AccessToken, "corrupt").unwrap();
        store.set(StoreKey::UserEmail, "a@b.com").unwrap();

        let session = session_with(store.clone(), 1_000);
        assert!(!session.is_authenticated().await);
        assert_eq!(store.get(StoreKey::AccessToken).unwrap(), None);
        assert_eq!(store.get(StoreKey::UserEmail).unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), 1_000);
        session
            .login_succeeded(&make_token("a@b.com", 2_000), Some("rt".to_string()))
            .await;

        let state = session.logged_out().await;
        assert!(!state.is_authenticated(at(1_000)));
        assert!(!session.is_authenticated().await);

        // A fresh hydrate from the cleared store is anonymous too
        let reloaded = session_with(store.clone(), 1_000);
        assert_eq!(reloaded.state().await.phase(), SessionPhase::Anonymous);
        for key in StoreKey::ALL {
            assert_eq!(store.get(key).unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_renewal_failure_clears_store() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), 1_000);
        let token = make_token("a@b.com", 2_000);
        session.login_succeeded(&token, None).await;

        let state = session
            .renewal_failed(&token, RenewalError::Rejected { status: 403 })
            .await
            .unwrap();
        assert_eq!(
            state.last_error(),
            Some(&SessionErrorKind::Renewal(RenewalError::Rejected { status: 403 }))
        );
        assert_eq!(store.get(StoreKey::AccessToken).unwrap(), None);
    }

    #[tokio::test]
    async fn test_renewal_outcome_ignored_after_session_moved_on() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store.clone(), 1_000);
        let stale = make_token("a@b.com", 1_500);
        session.login_succeeded(&stale, None).await;
        session.logged_out().await;

        // Renewal of the old token settles after logout
        let applied = session
            .renewed(&stale, &make_token("a@b.com", 5_000), Some("rt".to_string()))
            .await;
        assert_eq!(applied, None);
        assert!(!session.is_authenticated().await);
        assert_eq!(store.get(StoreKey::AccessToken).unwrap(), None);

        // A failed renewal of the old token must not log out a newer login
        let newer = make_token("b@c.com", 3_000);
        session.login_succeeded(&newer, None).await;
        let applied = session
            .renewal_failed(&stale, RenewalError::Rejected { status: 403 })
            .await;
        assert_eq!(applied, None);
        assert!(session.is_authenticated().await);
        assert_eq!(store.get(StoreKey::AccessToken).unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_status_reports_remaining_time() {
        let store = Arc::new(MemoryStore::new());
        let session = session_with(store, 1_000);
        session.login_succeeded(&make_token("a@b.com", 1_000 + 30 * 60), None).await;

        let status = session.status().await;
        assert_eq!(status.subject.as_deref(), Some("a@b.com"));
        assert!(status.authenticated);
        assert_eq!(status.minutes_until_expiry(), 30);
    }
}
