//! Bearer token decoding.
//!
//! Tokens are JWTs issued by the recollector backend. The client never
//! verifies signatures (it has no key); it only reads the `sub` and `exp`
//! claims so it can tell who is logged in and when the token stops working.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token is missing the '{0}' claim")]
    MissingClaim(&'static str),
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: Option<i64>,
}

/// A decoded bearer token.
///
/// Only [`Credential::decode`] builds one, so `expires_at` always comes from
/// the token's own `exp` claim.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    subject: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Parse a raw token into a credential.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let token = token.trim();
        let mut parts = token.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
            _ => {
                return Err(TokenError::Malformed(
                    "expected three dot-separated segments".to_string(),
                ))
            }
        };

        // Some issuers pad their segments even though JWT forbids it
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {}", e)))?;

        let claims: Claims = serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::Malformed(format!("payload is not JSON claims: {}", e)))?;

        let subject = claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(TokenError::MissingClaim("sub"))?;
        let exp = claims.exp.ok_or(TokenError::MissingClaim("exp"))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| TokenError::Malformed(format!("exp {} is out of range", exp)))?;

        Ok(Self {
            token: token.to_string(),
            subject,
            expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once `now` reaches the expiry instant. Equality counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True if the credential is expired or will be within `leeway`.
    ///
    /// With a zero leeway this is exactly [`Credential::is_expired`].
    pub fn needs_refresh(&self, now: DateTime<Utc>, leeway: chrono::Duration) -> bool {
        self.is_expired(now + leeway)
    }

    /// Time left before expiry, clamped at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

// Keep the raw token out of logs and panic messages.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
