use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session::{AccessGrant, SessionUpdate};
use crate::models::UserSummary;

/// Credentials returned by a successful refresh, login or OAuth callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    pub access_ttl_secs: u64,
    #[serde(rename = "refreshExpiresIn", default)]
    pub refresh_ttl_secs: Option<u64>,
}

/// The result of completing a login or OAuth-callback flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginGrant {
    #[serde(flatten)]
    pub grant: TokenGrant,
    #[serde(default)]
    pub user: Option<UserSummary>,
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl From<TokenGrant> for SessionUpdate {
    fn from(grant: TokenGrant) -> Self {
        SessionUpdate {
            access: Some(AccessGrant {
                token: grant.access_token,
                ttl_secs: grant.access_ttl_secs,
            }),
            refresh_token: grant.refresh_token,
            refresh_ttl_secs: grant.refresh_ttl_secs,
            user: None,
        }
    }
}

impl From<LoginGrant> for SessionUpdate {
    fn from(login: LoginGrant) -> Self {
        SessionUpdate {
            user: login.user,
            ..SessionUpdate::from(login.grant)
        }
    }
}

/// Why a refresh attempt produced no new access token.
///
/// Cloneable so every caller waiting on the same attempt receives the same
/// outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token has expired")]
    RefreshExpired,

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Refresh rejected by server: {0}")]
    Rejected(String),

    #[error("Refresh timed out")]
    Timeout,

    #[error("Session changed while the refresh was in flight")]
    Superseded,

    #[error("Refresh task aborted: {0}")]
    Aborted(String),
}

impl RefreshError {
    /// Whether this outcome must drop the session.
    ///
    /// `Superseded` means the session was already replaced or cleared by
    /// someone else, so there is nothing left to fail closed on.
    pub fn clears_session(&self) -> bool {
        !matches!(self, RefreshError::Superseded)
    }
}

/// The network call that trades a refresh token for new credentials.
pub trait RefreshOperation: Send + Sync + 'static {
    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<TokenGrant, RefreshError>> + Send;
}

/// The complete set of remote authentication endpoints.
pub trait AuthBackend: RefreshOperation {
    fn login(&self, credentials: &Credentials) -> impl Future<Output = Result<LoginGrant>> + Send;

    /// Best-effort server-side revocation of `refresh_token`
    fn logout(&self, refresh_token: &str) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_refresh_response() {
        let json = r#"{"accessToken":"a2","refreshToken":"r2","expiresIn":900,"refreshExpiresIn":86400}"#;
        let grant: TokenGrant = serde_json::from_str(json).expect("Failed to parse grant JSON");
        assert_eq!(grant.access_token, "a2");
        assert_eq!(grant.refresh_token.as_deref(), Some("r2"));
        assert_eq!(grant.access_ttl_secs, 900);
        assert_eq!(grant.refresh_ttl_secs, Some(86400));
    }

    #[test]
    fn test_parse_refresh_response_without_rotation() {
        let json = r#"{"accessToken":"a2","expiresIn":900}"#;
        let grant: TokenGrant = serde_json::from_str(json).expect("Failed to parse grant JSON");
        assert!(grant.refresh_token.is_none());
        assert!(grant.refresh_ttl_secs.is_none());

        // A grant without rotation must not erase the stored refresh token
        let update = SessionUpdate::from(grant);
        assert!(update.refresh_token.is_none());
        assert!(update.user.is_none());
    }

    #[test]
    fn test_parse_login_response_with_user() {
        let json = r#"{"accessToken":"a1","refreshToken":"r1","expiresIn":900,"refreshExpiresIn":86400,"user":{"id":"1","email":"a@b.c","name":null,"avatarUrl":null}}"#;
        let login: LoginGrant = serde_json::from_str(json).expect("Failed to parse login JSON");
        let update = SessionUpdate::from(login);
        assert_eq!(update.user.map(|u| u.email), Some("a@b.c".to_string()));
        assert_eq!(update.refresh_token.as_deref(), Some("r1"));
    }

    #[test]
    fn test_only_superseded_keeps_session() {
        assert!(!RefreshError::Superseded.clears_session());
        assert!(RefreshError::Timeout.clears_session());
        assert!(RefreshError::Rejected("revoked".into()).clears_session());
        assert!(RefreshError::Network("reset".into()).clears_session());
    }
}
