//! Outbound and inbound auth hooks around the transport.
//!
//! The outbound hook makes sure every request leaves with a fresh bearer
//! token. The inbound hook turns a 401 into one renewal-and-retry. A request
//! is retried at most once, tracked by [`RequestContext::retry_count`].

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::transport::{ApiRequest, ApiResponse, Transport};
use super::ApiError;
use crate::auth::{Credential, RenewalCoordinator, RenewalError};

/// A request on its way through the interceptor chain.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: ApiRequest,
    pub retry_count: u32,
}

impl RequestContext {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retry_count: 0,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }
}

pub struct AuthInterceptor {
    coordinator: Arc<RenewalCoordinator>,
}

impl AuthInterceptor {
    pub fn new(coordinator: Arc<RenewalCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Attach a fresh credential, renewing it first if it is stale.
    ///
    /// If no credential can be had the request goes out without one; the
    /// server's 401 then takes the inbound path.
    pub async fn on_request(&self, mut ctx: RequestContext) -> RequestContext {
        match self.coordinator.ensure_fresh().await {
            Ok(credential) => {
                if let Err(e) = attach(&mut ctx.request, &credential) {
                    warn!(error = %e, "Could not attach credential");
                    ctx.request.clear_bearer();
                }
            }
            Err(RenewalError::NoSession) => {
                debug!(path = %ctx.request.path, "No session, sending request without credentials");
                ctx.request.clear_bearer();
            }
            Err(e) => {
                warn!(path = %ctx.request.path, error = %e, "No valid credential, sending request without one");
                ctx.request.clear_bearer();
            }
        }
        ctx
    }

    /// Pass responses through, except a first 401: renew and re-send once.
    pub async fn on_response(
        &self,
        transport: &dyn Transport,
        mut ctx: RequestContext,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        let response = outcome?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if ctx.is_retry() {
            return Err(failed_after_retry(&ctx, response));
        }

        info!(
            method = %ctx.request.method,
            path = %ctx.request.path,
            "Received 401 Unauthorized, renewing credentials and retrying"
        );
        ctx.retry_count += 1;

        let credential = match self.coordinator.ensure_fresh().await {
            Ok(credential) => credential,
            // Nothing to renew: the original 401 stands
            Err(RenewalError::NoSession) => {
                return Err(ApiError::from_status(response.status, &response.body))
            }
            Err(e) => {
                warn!(error = %e, "Renewal after 401 failed");
                return Err(e.into());
            }
        };
        attach(&mut ctx.request, &credential)?;

        let retried = transport.send(&ctx.request).await?;
        if retried.status == StatusCode::UNAUTHORIZED {
            return Err(failed_after_retry(&ctx, retried));
        }
        Ok(retried)
    }
}

fn attach(request: &mut ApiRequest, credential: &Credential) -> Result<(), ApiError> {
    debug!(path = %request.path, subject = %credential.subject(), "Attaching credential");
    request.set_bearer(credential.token())
}

fn failed_after_retry(ctx: &RequestContext, response: ApiResponse) -> ApiError {
    warn!(
        method = %ctx.request.method,
        path = %ctx.request.path,
        retry_count = ctx.retry_count,
        "Request still unauthorized after retry"
    );
    ApiError::RequestFailedAfterRetry {
        status: response.status.as_u16(),
        body: ApiError::truncate_body(&response.body),
    }
}

// ============================================================================
// Tests
// ============================================================================
