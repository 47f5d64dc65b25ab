//! Wire types for the recollector backend.

use serde::{Deserialize, Serialize};

use super::ApiError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub current_page: Option<u32>,
    pub items_per_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub total_items: Option<u64>,
    pub sort_field: Option<String>,
    pub sort_direction: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    pub pagination: Option<PaginationInfo>,
}

/// Every backend response is wrapped in this envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub status_message: String,
    pub data: Option<T>,
    pub meta: Option<MetaInfo>,
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    /// The payload, which a successful response must carry.
    pub fn into_data(self) -> Result<T, ApiError> {
        match self.data {
            Some(data) => Ok(data),
            None => Err(ApiError::InvalidResponse(
                self.error
                    .unwrap_or_else(|| "Unexpected response format or missing data".to_string()),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub email: Option<String>,
    pub jwt_token: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub password_confirm: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangePasswordRequest<'a> {
    pub email: &'a str,
    pub password_current: &'a str,
    pub password: &'a str,
    pub password_confirm: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountDeleteRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub password_confirm: &'a str,
}

#[derive(Serialize)]
pub(crate) struct ForgotPasswordRequest<'a> {
    pub email: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResetPasswordRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub password_confirm: &'a str,
    pub password_reset_token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogoutRequest<'a> {
    pub user_email: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenRefreshRequest<'a> {
    pub user_email: &'a str,
    pub access_token: &'a str,
}
