//! REST API layer for the recollector backend.
//!
//! [`ApiClient`] sends requests through the [`AuthInterceptor`], which keeps
//! a fresh bearer token on every request and retries a 401 once after
//! renewing. [`HttpRefreshBackend`] performs the renewal call itself on the
//! plain [`Transport`].

pub mod client;
pub mod dto;
pub mod error;
pub mod interceptor;
pub mod refresh;
pub mod transport;

pub use client::ApiClient;
pub use dto::{Envelope, MetaInfo, PaginationInfo, UserDto};
pub use error::ApiError;
pub use interceptor::{AuthInterceptor, RequestContext};
pub use refresh::HttpRefreshBackend;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
