//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `Credential`: a decoded bearer token (subject + expiry)
//! - `Session`: the single source of truth for who is logged in
//! - `RenewalCoordinator`: single-flight token renewal
//! - `KeyValueStore`: where the session is persisted between runs

pub mod codec;
pub mod renewal;
pub mod session;
pub mod store;

pub use codec::{Credential, TokenError};
pub use renewal::{RefreshBackend, RefreshRequest, RenewalCoordinator, RenewalError, RenewedToken};
pub use session::{Session, SessionErrorKind, SessionPhase, SessionState, SessionStatus};
pub use store::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StoreBackend, StoreKey};
