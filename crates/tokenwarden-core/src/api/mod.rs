//! HTTP glue for the dashboard API.
//!
//! This module provides the `HttpAuthBackend` for the login, refresh and
//! logout endpoints, and the `AuthorizedClient` that attaches bearer tokens
//! to every other API call, renewing them through the session's
//! `RefreshCoordinator` when they expire or are rejected.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::HttpAuthBackend;
pub use client::AuthorizedClient;
pub use error::ApiError;
