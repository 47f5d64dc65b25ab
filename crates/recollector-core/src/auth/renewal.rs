//! Single-flight session renewal.
//!
//! Every caller that finds the credential stale goes through
//! [`RenewalCoordinator::ensure_fresh`]. The first one starts a renewal task;
//! everyone arriving while it runs awaits the same shared outcome, so a burst
//! of requests costs exactly one call to the refresh endpoint.
//!
//! The renewal runs on its own task and always completes, even if every
//! caller stops waiting. Abandoning it halfway would leave the session and
//! the store out of step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::codec::Credential;
use super::session::Session;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No session to renew")]
    NoSession,

    #[error("Refresh rejected by server (status {status})")]
    Rejected { status: u16 },

    #[error("Refresh endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Renewed token could not be installed: {0}")]
    InvalidToken(String),

    #[error("Renewal task aborted: {0}")]
    Aborted(String),

    /// The session was logged out or replaced while the refresh call ran.
    #[error("Session changed while renewal was in flight")]
    Superseded,
}

/// What the refresh endpoint needs to issue a new token.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub subject: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("subject", &self.subject)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewedToken {
    pub access_token: String,
    /// Replacement refresh token, if the server rotated it.
    pub refresh_token: Option<String>,
}

/// The backend's token refresh endpoint.
#[async_trait]
pub trait RefreshBackend: Send + Sync {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RenewedToken, RenewalError>;
}

type PendingRenewal = Shared<BoxFuture<'static, Result<Credential, RenewalError>>>;

pub struct RenewalCoordinator {
    session: Arc<Session>,
    backend: Arc<dyn RefreshBackend>,
    leeway: Duration,
    // Present only while a renewal is in flight
    pending: Arc<Mutex<Option<PendingRenewal>>>,
}

impl RenewalCoordinator {
    pub fn new(session: Arc<Session>, backend: Arc<dyn RefreshBackend>) -> Self {
        Self {
            session,
            backend,
            leeway: Duration::zero(),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Renew credentials that expire within `leeway`, not only expired ones.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway.max(Duration::zero());
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Return a credential that is valid now, renewing it first if needed.
    ///
    /// Fails with [`RenewalError::NoSession`] without any network call when
    /// nobody is logged in. A rejected refresh or an unusable renewed token
    /// has already logged the session out by the time it is returned. If the
    /// session was logged out or replaced while the refresh ran, the result is
    /// dropped and [`RenewalError::Superseded`] returned.
    pub async fn ensure_fresh(&self) -> Result<Credential, RenewalError> {
        let pending = {
            let mut slot = self.pending.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight renewal");
                    pending.clone()
                }
                None => {
                    let state = self.session.state().await;
                    let stale = match state.credential() {
                        None => return Err(RenewalError::NoSession),
                        Some(credential)
                            if !credential.needs_refresh(self.session.now(), self.leeway) =>
                        {
                            return Ok(credential.clone())
                        }
                        Some(credential) => credential.clone(),
                    };
                    let request = RefreshRequest {
                        subject: stale.subject().to_string(),
                        access_token: stale.token().to_string(),
                        refresh_token: state.refresh_token().map(str::to_string),
                    };
                    let pending = self.start(request);
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn start(&self, request: RefreshRequest) -> PendingRenewal {
        info!(subject = %request.subject, "Credential is stale, starting renewal");

        let session = Arc::clone(&self.session);
        let backend = Arc::clone(&self.backend);
        let slot = Arc::clone(&self.pending);
        let task = tokio::spawn(async move {
            let outcome = renew(&session, backend.as_ref(), &request).await;
            slot.lock().await.take();
            outcome
        });

        let slot = Arc::clone(&self.pending);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The session was never transitioned, so the next caller
                    // starts over from the stale credential.
                    error!(error = %e, "Renewal task did not complete");
                    slot.lock().await.take();
                    Err(RenewalError::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}

async fn renew(
    session: &Session,
    backend: &dyn RefreshBackend,
    request: &RefreshRequest,
) -> Result<Credential, RenewalError> {
    let from_token = request.access_token.as_str();
    let renewed = match backend.refresh(request).await {
        Ok(renewed) => renewed,
        Err(e) => {
            // A newer session is left alone; waiters still see the failure
            session.renewal_failed(from_token, e.clone()).await;
            return Err(e);
        }
    };

    let state = session
        .renewed(from_token, &renewed.access_token, renewed.refresh_token)
        .await
        .ok_or(RenewalError::Superseded)?;
    match state.credential() {
        Some(credential) => Ok(credential.clone()),
        None => Err(RenewalError::InvalidToken(
            state
                .last_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no credential".to_string()),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
