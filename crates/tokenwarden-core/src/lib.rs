//! tokenwarden core - session and token lifecycle for the dashboard client.
//!
//! Holds the persisted credential pair, renews the access token ahead of
//! expiry and on demand, collapses concurrent renewals into one network call,
//! and decides whether protected views may render.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

pub use api::{ApiError, AuthorizedClient, HttpAuthBackend};
pub use auth::{
    AuthBackend, Clock, Credentials, GuardDecision, LoginGrant, RefreshCoordinator, RefreshError,
    RefreshOperation, SchedulerHandle, Session, SessionConfig, SessionGuard, SessionManager,
    SessionState, SessionUpdate, SystemClock, TokenGrant,
};
pub use config::{Config, StorageBackend};
pub use models::UserSummary;
pub use storage::SessionStorage;
