use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::clock::Clock;
use super::coordinator::RefreshCoordinator;
use super::guard::SessionGuard;
use super::refresh::{AuthBackend, Credentials, LoginGrant};
use super::scheduler::{ProactiveScheduler, SchedulerHandle};
use super::session::{SessionConfig, SessionState, SessionUpdate};
use crate::api::AuthorizedClient;
use crate::storage::SessionStorage;

/// One constructed session lifecycle: the store, the backend it renews
/// through, and the coordinator every refresh funnels into.
///
/// Clone is cheap; clones share the same session.
pub struct SessionManager<B> {
    state: Arc<SessionState>,
    backend: Arc<B>,
    coordinator: Arc<RefreshCoordinator<B>>,
    config: SessionConfig,
}

impl<B> Clone for SessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            backend: Arc::clone(&self.backend),
            coordinator: Arc::clone(&self.coordinator),
            config: self.config.clone(),
        }
    }
}

impl<B: AuthBackend> SessionManager<B> {
    /// Build the manager and rehydrate the session from `storage`
    pub fn open(
        backend: B,
        storage: Box<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let state = Arc::new(SessionState::open(storage, clock, &config));
        let backend = Arc::new(backend);
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&state),
            Arc::clone(&backend),
            config.refresh_timeout,
        ));
        Self {
            state,
            backend,
            coordinator,
            config,
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator<B>> {
        &self.coordinator
    }

    /// Authenticate with email and password and start a new session
    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        let grant = self
            .backend
            .login(credentials)
            .await
            .context("Login failed")?;
        self.complete_login(grant);
        Ok(())
    }

    /// Install the credentials produced by a login or OAuth callback.
    ///
    /// Replaces whatever session was there; a previous user's display data
    /// never leaks into the new session.
    pub fn complete_login(&self, grant: LoginGrant) {
        self.state.replace(SessionUpdate::from(grant));
        info!("Session established");
    }

    /// Tell the server (best effort), then drop the local session regardless
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.state.read().refresh_token() {
            if let Err(e) = self.backend.logout(refresh_token).await {
                warn!(error = %e, "Logout notification failed, clearing locally");
            }
        }
        self.state.clear();
    }

    /// Arm a proactive refresh timer for a protected view.
    ///
    /// Each call gets its own timer; all of them renew through the shared
    /// coordinator.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        ProactiveScheduler::new(
            Arc::clone(&self.state),
            Arc::clone(&self.coordinator),
            self.config.refresh_lead,
        )
        .start()
    }

    pub fn guard(&self) -> SessionGuard {
        SessionGuard::new(Arc::clone(&self.state))
    }

    /// An HTTP client whose requests carry this session's bearer token
    pub fn authorized_client(&self, base_url: impl Into<String>, timeout: Duration) -> Result<AuthorizedClient<B>> {
        AuthorizedClient::new(base_url, timeout, Arc::clone(&self.coordinator))
    }
}
