//! Remote authentication endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use super::client::check_response;
use super::ApiError;
use crate::auth::{AuthBackend, Credentials, LoginGrant, RefreshError, RefreshOperation, TokenGrant};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct OAuthCallbackRequest<'a> {
    code: &'a str,
}

/// Login, refresh and logout against the dashboard API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing connection pool
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Trade an OAuth authorization code for a session
    pub async fn exchange_oauth_code(&self, provider: &str, code: &str) -> Result<LoginGrant> {
        let url = self.url(&format!("auth/oauth/{}/callback", provider));
        let response = self
            .client
            .post(&url)
            .json(&OAuthCallbackRequest { code })
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send OAuth callback request")?;

        let response = check_response(response).await?;
        response
            .json()
            .await
            .context("Failed to parse OAuth callback response")
    }
}

impl RefreshOperation for HttpAuthBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let url = self.url("auth/refresh");
        debug!(url = %url, "Requesting token refresh");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = ApiError::truncate_body(&body);
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    RefreshError::Rejected(format!("Status {}: {}", status, body))
                }
                _ => RefreshError::Network(format!("Status {}: {}", status, body)),
            });
        }

        response
            .json()
            .await
            .map_err(|e| RefreshError::Network(format!("Invalid refresh response: {}", e)))
    }
}

impl AuthBackend for HttpAuthBackend {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant> {
        let url = self.url("auth/login");
        let response = self
            .client
            .post(&url)
            .json(credentials)
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send login request")?;

        let response = check_response(response).await?;
        response.json().await.context("Failed to parse login response")
    }

    async fn logout(&self, refresh_token: &str) -> Result<()> {
        let url = self.url("auth/logout");
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send logout request")?;

        check_response(response).await?;
        Ok(())
    }
}
