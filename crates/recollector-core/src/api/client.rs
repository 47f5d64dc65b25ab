//! API client for the recollector backend.
//!
//! Business requests go through [`ApiClient::execute`], which wraps the
//! transport with the [`AuthInterceptor`] hooks. The login, registration and
//! password-reset endpoints are called anonymously on the raw transport.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::dto::{
    AccountDeleteRequest, ChangePasswordRequest, Envelope, ForgotPasswordRequest, LoginRequest,
    LogoutRequest, RegisterRequest, ResetPasswordRequest, UserDto,
};
use super::interceptor::{AuthInterceptor, RequestContext};
use super::refresh::{HttpRefreshBackend, REFRESH_COOKIE};
use super::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::{Credential, RenewalCoordinator, Session, SessionErrorKind};
use crate::clock::SystemClock;
use crate::config::Config;

// ============================================================================
// Endpoints
// ============================================================================

const LOGIN_PATH: &str = "/v1/auth/login";
const LOGOUT_PATH: &str = "/v1/auth/logout";
const REGISTER_PATH: &str = "/v1/auth/register";
const CHANGE_PASSWORD_PATH: &str = "/v1/auth/change-password";
const FORGOT_PASSWORD_PATH: &str = "/v1/auth/forgot-password";
const RESET_PASSWORD_PATH: &str = "/v1/auth/reset-password";
const DELETE_ACCOUNT_PATH: &str = "/v1/auth/delete-account";

/// API client for the recollector backend.
/// Clone is cheap; all clones share one session and one renewal coordinator.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    interceptor: Arc<AuthInterceptor>,
    coordinator: Arc<RenewalCoordinator>,
}

impl ApiClient {
    /// `transport` must be the plain transport, the same one the refresh
    /// backend uses.
    pub fn new(transport: Arc<dyn Transport>, coordinator: Arc<RenewalCoordinator>) -> Self {
        Self {
            transport,
            interceptor: Arc::new(AuthInterceptor::new(coordinator.clone())),
            coordinator,
        }
    }

    /// Build the production stack from configuration.
    pub fn connect(config: &Config) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
            &config.base_url,
            config.request_timeout(),
        )?);
        let store = config.store.open(&config.cache_dir()?);
        let session = Arc::new(Session::load(store, Arc::new(SystemClock)));
        let backend = Arc::new(HttpRefreshBackend::new(transport.clone()));
        let coordinator = Arc::new(
            RenewalCoordinator::new(session, backend).with_leeway(config.refresh_leeway()),
        );
        debug!(base_url = %config.base_url, "API client ready");
        Ok(Self::new(transport, coordinator))
    }

    pub fn session(&self) -> &Arc<Session> {
        self.coordinator.session()
    }

    // ========================================================================
    // Request pipeline
    // ========================================================================

    /// Send a request through the auth hooks.
    ///
    /// Returns whatever the server answered, including error statuses other
    /// than a 401 the retry could not resolve.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let ctx = self.interceptor.on_request(RequestContext::new(request)).await;
        let outcome = self.transport.send(&ctx.request).await;
        self.interceptor
            .on_response(self.transport.as_ref(), ctx, outcome)
            .await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = Self::check_response(self.execute(ApiRequest::get(path)).await?)?;
        response.json::<Envelope<T>>()?.into_data()
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let request = ApiRequest::post(path, body)?;
        let response = Self::check_response(self.execute(request).await?)?;
        response.json::<Envelope<T>>()?.into_data()
    }

    async fn send_anonymous(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.transport.send(&request).await?;
        Self::check_response(response)
    }

    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    /// The backend reads the refresh cookie on logout and password change.
    async fn with_refresh_cookie(&self, mut request: ApiRequest) -> Result<ApiRequest, ApiError> {
        if let Some(refresh_token) = self.session().state().await.refresh_token() {
            request.set_cookie(REFRESH_COOKIE, refresh_token)?;
        }
        Ok(request)
    }

    async fn current_subject(&self) -> Result<String, ApiError> {
        self.session()
            .credential()
            .await
            .map(|c| c.subject().to_string())
            .ok_or(ApiError::Unauthorized)
    }

    // ========================================================================
    // Authentication flows
    // ========================================================================

    /// Log in and install the returned token.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, ApiError> {
        info!(email = %email, "Logging in");
        let request = ApiRequest::post(LOGIN_PATH, &LoginRequest { email, password })?;

        let response = match self.send_anonymous(request).await {
            Ok(response) => response,
            Err(e) => {
                self.session().login_failed(e.to_string()).await;
                return Err(e);
            }
        };

        let token = match response
            .json::<Envelope<UserDto>>()
            .and_then(Envelope::into_data)
            .map(|user| user.jwt_token.filter(|t| !t.is_empty()))
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                let e = ApiError::InvalidResponse("No token returned".to_string());
                self.session().login_failed(e.to_string()).await;
                return Err(e);
            }
            Err(e) => {
                self.session().login_failed(e.to_string()).await;
                return Err(e);
            }
        };

        let state = self
            .session()
            .login_succeeded(&token, response.cookie(REFRESH_COOKIE))
            .await;
        match state.credential() {
            Some(credential) => Ok(credential.clone()),
            None => Err(ApiError::Login(
                state
                    .last_error()
                    .cloned()
                    .unwrap_or(SessionErrorKind::TokenExpired),
            )),
        }
    }

    /// Tell the backend, then drop the local session whatever it answered.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = match self.session().credential().await {
            Some(credential) => self.notify_logout(credential.subject()).await,
            None => Ok(()),
        };
        if let Err(ref e) = result {
            warn!(error = %e, "Logout request failed, clearing local session anyway");
        }
        self.session().logged_out().await;
        result
    }

    async fn notify_logout(&self, email: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(LOGOUT_PATH, &LogoutRequest { user_email: email })?;
        let request = self.with_refresh_cookie(request).await?;
        Self::check_response(self.execute(request).await?)?;
        Ok(())
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        password_confirm: &str,
    ) -> Result<UserDto, ApiError> {
        let request = ApiRequest::post(
            REGISTER_PATH,
            &RegisterRequest {
                email,
                password,
                password_confirm,
            },
        )?;
        let response = self.send_anonymous(request).await?;
        response.json::<Envelope<UserDto>>()?.into_data()
    }

    /// Change the password of the logged-in user.
    ///
    /// The backend revokes both tokens on success, so the local session is
    /// cleared too.
    pub async fn change_password(
        &self,
        password_current: &str,
        password: &str,
        password_confirm: &str,
    ) -> Result<UserDto, ApiError> {
        let email = self.current_subject().await?;
        let request = ApiRequest::post(
            CHANGE_PASSWORD_PATH,
            &ChangePasswordRequest {
                email: &email,
                password_current,
                password,
                password_confirm,
            },
        )?;
        let request = self.with_refresh_cookie(request).await?;
        let response = Self::check_response(self.execute(request).await?)?;
        let user = response.json::<Envelope<UserDto>>()?.into_data()?;

        info!(email = %email, "Password changed, session revoked");
        self.session().logged_out().await;
        Ok(user)
    }

    pub async fn forgot_password(&self, email: &str) -> Result<String, ApiError> {
        let request = ApiRequest::post(FORGOT_PASSWORD_PATH, &ForgotPasswordRequest { email })?;
        let response = self.send_anonymous(request).await?;
        response.json::<Envelope<String>>()?.into_data()
    }

    pub async fn reset_password(
        &self,
        email: &str,
        password: &str,
        password_confirm: &str,
        password_reset_token: &str,
    ) -> Result<UserDto, ApiError> {
        let request = ApiRequest::post(
            RESET_PASSWORD_PATH,
            &ResetPasswordRequest {
                email,
                password,
                password_confirm,
                password_reset_token,
            },
        )?;
        let response = self.send_anonymous(request).await?;
        response.json::<Envelope<UserDto>>()?.into_data()
    }

    /// Delete the logged-in account, then log out locally.
    pub async fn delete_account(
        &self,
        password: &str,
        password_confirm: &str,
    ) -> Result<String, ApiError> {
        let email = self.current_subject().await?;
        let request = ApiRequest::post(
            DELETE_ACCOUNT_PATH,
            &AccountDeleteRequest {
                email: &email,
                password,
                password_confirm,
            },
        )?;
        let response = Self::check_response(self.execute(request).await?)?;
        let message = response.json::<Envelope<String>>()?.into_data()?;

        info!(email = %email, "Account deleted");
        self.session().logged_out().await;
        Ok(message)
    }
}

// ============================================================================
// Tests
// ============================================================================
