//! HTTP client that attaches the session's bearer token.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{RefreshCoordinator, RefreshOperation};

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries when rate limited (HTTP 429).
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Check if response is successful, returning an error with body if not.
pub(crate) async fn check_response(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body).into())
    }
}

/// Sends requests on behalf of the current session.
///
/// The bearer token comes from the refresh coordinator, so an expired token
/// is renewed before the request goes out. A 401 on a token that looked
/// valid triggers one shared refresh and one retry.
pub struct AuthorizedClient<R> {
    client: Client,
    base_url: String,
    coordinator: Arc<RefreshCoordinator<R>>,
}

impl<R> Clone for AuthorizedClient<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<R: RefreshOperation> AuthorizedClient<R> {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        coordinator: Arc<RefreshCoordinator<R>>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, coordinator))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        coordinator: Arc<RefreshCoordinator<R>>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            coordinator,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send::<()>(Method::GET, path, None, None).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send(Method::POST, path, Some(body), None).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    /// Send a request and return the successful response.
    ///
    /// `token_override` is used as-is: no refresh before sending and no
    /// retry on 401.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        token_override: Option<&str>,
    ) -> Result<Response> {
        let url = self.url(path);
        let managed = token_override.is_none();
        let mut token = match token_override {
            Some(token) => Some(token.to_string()),
            None => self.coordinator.access_token().await,
        };
        let mut retried = false;

        loop {
            let response = self
                .send_with_backoff(&method, &url, body, token.as_deref())
                .await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return check_response(response).await;
            }

            let rejected = match token.as_deref() {
                Some(rejected) if managed && !retried => rejected,
                _ => return Err(ApiError::Unauthorized.into()),
            };

            debug!(url = %url, "Bearer token rejected, refreshing");
            retried = true;
            match self.coordinator.refresh_rejected(rejected).await {
                Ok(fresh) => token = Some(fresh),
                Err(e) => {
                    warn!(error = %e, "Refresh after 401 failed");
                    return Err(ApiError::Unauthorized)
                        .with_context(|| format!("Session could not be renewed: {}", e));
                }
            }
        }
    }

    async fn send_with_backoff<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&B>,
        token: Option<&str>,
    ) -> Result<Response> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send {} request to {}", method, url))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited.into());
            }
            warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }
}
