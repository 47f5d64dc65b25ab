use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::dto::{Envelope, TokenRefreshRequest, UserDto};
use super::transport::{ApiRequest, Transport};
use crate::auth::{RefreshBackend, RefreshRequest, RenewalError, RenewedToken};

pub(crate) const REFRESH_PATH: &str = "/v1/auth/refresh-token";

/// Cookie the backend uses for the long-lived refresh token
pub(crate) const REFRESH_COOKIE: &str = "refreshToken";

/// Calls the backend refresh endpoint.
///
/// Must be given a plain transport, never one that runs the auth
/// interceptors, or a refresh could trigger another refresh.
pub struct HttpRefreshBackend {
    transport: Arc<dyn Transport>,
}

impl HttpRefreshBackend {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn build_request(request: &RefreshRequest) -> Result<ApiRequest, RenewalError> {
        let body = TokenRefreshRequest {
            user_email: &request.subject,
            access_token: &request.access_token,
        };
        let mut api_request = ApiRequest::post(REFRESH_PATH, &body)
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
        api_request
            .set_bearer(&request.access_token)
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
        if let Some(ref refresh_token) = request.refresh_token {
            api_request
                .set_cookie(REFRESH_COOKIE, refresh_token)
                .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
        }
        Ok(api_request)
    }
}

#[async_trait]
impl RefreshBackend for HttpRefreshBackend {
    async fn refresh(&self, request: &RefreshRequest) -> Result<RenewedToken, RenewalError> {
        let api_request = Self::build_request(request)?;
        debug!(subject = %request.subject, "Requesting token refresh");

        let response = self
            .transport
            .send(&api_request)
            .await
            .map_err(|e| RenewalError::Unreachable(e.to_string()))?;

        if !response.is_success() {
            warn!(status = response.status.as_u16(), "Token refresh rejected");
            return Err(RenewalError::Rejected {
                status: response.status.as_u16(),
            });
        }

        let envelope: Envelope<UserDto> = response
            .json()
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
        let access_token = envelope
            .into_data()
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?
            .jwt_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RenewalError::InvalidResponse("No token returned".to_string()))?;

        Ok(RenewedToken {
            access_token,
            refresh_token: response.cookie(REFRESH_COOKIE),
        })
    }
}
