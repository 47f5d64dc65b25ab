//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};

use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{RefreshBackend, RefreshRequest, RenewalError, RenewedToken};
use crate::clock::Clock;

/// Instant at `secs` since the epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// An unsigned JWT carrying `sub` and `exp`.
pub fn make_token(subject: &str, expires_at: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({ "sub": subject, "exp": expires_at, "iat": expires_at - 3600 });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .unwrap()
    }
}

/// Refresh backend that counts calls and returns a canned outcome.
pub struct CountingBackend {
    calls: AtomicUsize,
    outcome: Result<RenewedToken, RenewalError>,
    delay: Duration,
    last_request: Mutex<Option<RefreshRequest>>,
}

impl CountingBackend {
    pub fn succeeding(token: &str) -> Self {
        Self::with_outcome(Ok(RenewedToken {
            access_token: token.to_string(),
            refresh_token: None,
        }))
    }

    pub fn failing(error: RenewalError) -> Self {
        Self::with_outcome(Err(error))
    }

    fn with_outcome(outcome: Result<RenewedToken, RenewalError>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome,
            delay: Duration::ZERO,
            last_request: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: &str) -> Self {
        if let Ok(ref mut renewed) = self.outcome {
            renewed.refresh_token = Some(refresh_token.to_string());
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<RefreshRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl RefreshBackend for CountingBackend {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RenewedToken, RenewalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

type Responder = dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync;

/// Transport that records every request and answers from a closure.
pub struct ScriptedTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        responder: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        // Yield so concurrent flows interleave like real I/O
        tokio::task::yield_now().await;
        (self.responder)(request)
    }
}
