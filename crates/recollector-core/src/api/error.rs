use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::{RenewalError, SessionErrorKind};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session renewal failed: {0}")]
    Renewal(#[from] RenewalError),

    #[error("Request still unauthorized after retry (status {status}): {body}")]
    RequestFailedAfterRetry { status: u16, body: String },

    #[error("Login failed: {0}")]
    Login(SessionErrorKind),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// The error fields of the backend's response envelope.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Prefer the envelope's `error`, then `message`, then the raw body.
    fn describe(body: &str) -> String {
        serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error.or(b.message))
            .filter(|m| !m.is_empty())
            .map(|m| Self::truncate_body(&m))
            .unwrap_or_else(|| Self::truncate_body(body))
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = Self::describe(body);
        match status.as_u16() {
            400 => ApiError::BadRequest(message),
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// True for failures that mean the caller must log in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized
                | ApiError::Renewal(_)
                | ApiError::RequestFailedAfterRetry { .. }
                | ApiError::Login(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_uses_envelope_error() {
        let body = r#"{"statusCode":404,"statusMessage":"Not Found","error":"Category not found"}"#;
        match ApiError::from_status(StatusCode::NOT_FOUND, body) {
            ApiError::NotFound(message) => assert_eq!(message, "Category not found"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_status_falls_back_to_message_then_body() {
        match ApiError::from_status(StatusCode::FORBIDDEN, r#"{"message":"nope"}"#) {
            ApiError::AccessDenied(message) => assert_eq!(message, "nope"),
            other => panic!("unexpected error: {:?}", other),
        }
        match ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream down") {
            ApiError::ServerError(message) => assert_eq!(message, "upstream down"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(ApiError::from_status(StatusCode::UNAUTHORIZED, ""), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_REQUEST, "x"), ApiError::BadRequest(_)));
        assert!(matches!(ApiError::from_status(StatusCode::IM_A_TEAPOT, "x"), ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_truncate_body() {
        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
        assert_eq!(ApiError::truncate_body("short"), "short");
    }

    #[test]
    fn test_requires_login() {
        assert!(ApiError::Unauthorized.requires_login());
        assert!(ApiError::Renewal(RenewalError::Rejected { status: 403 }).requires_login());
        assert!(!ApiError::RateLimited.requires_login());
    }
}
