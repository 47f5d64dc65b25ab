//! Recollector core - session handling and API access for the recollector
//! backend.
//!
//! Every request leaves with a current bearer token. An expired token is
//! renewed once no matter how many requests notice it at the same time, and a
//! request the server still rejects with 401 is retried exactly once.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse};
pub use auth::{Credential, RenewalCoordinator, RenewalError, Session, SessionStatus, StoreBackend};
pub use clock::{Clock, SystemClock};
pub use config::Config;
