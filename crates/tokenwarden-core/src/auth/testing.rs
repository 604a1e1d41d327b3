//! Scriptable auth backend shared by the auth module's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::clock::Clock;
use super::refresh::{AuthBackend, Credentials, LoginGrant, RefreshError, RefreshOperation, TokenGrant};

pub(crate) struct FakeBackend {
    calls: AtomicUsize,
    logout_calls: AtomicUsize,
    call_times: Mutex<Vec<DateTime<Utc>>>,
    seen_tokens: Mutex<Vec<String>>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    gate: Option<Arc<Notify>>,
    fail_with: Option<RefreshError>,
    fail_logout: bool,
    access_ttl_secs: u64,
}

impl FakeBackend {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            seen_tokens: Mutex::new(Vec::new()),
            clock,
            delay: Duration::ZERO,
            gate: None,
            fail_with: None,
            fail_logout: false,
            access_ttl_secs: 60,
        }
    }

    /// Each refresh takes this long before answering
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each refresh waits for a permit on `gate` before answering
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn failing(mut self, error: RefreshError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub(crate) fn failing_logout(mut self) -> Self {
        self.fail_logout = true;
        self
    }

    pub(crate) fn with_ttl(mut self, secs: u64) -> Self {
        self.access_ttl_secs = secs;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn call_times(&self) -> Vec<DateTime<Utc>> {
        self.call_times.lock().unwrap().clone()
    }

    pub(crate) fn seen_tokens(&self) -> Vec<String> {
        self.seen_tokens.lock().unwrap().clone()
    }
}

impl RefreshOperation for FakeBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(self.clock.now());
        self.seen_tokens.lock().unwrap().push(refresh_token.to_string());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(TokenGrant {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                access_ttl_secs: self.access_ttl_secs,
                refresh_ttl_secs: Some(3600),
            }),
        }
    }
}

impl AuthBackend for FakeBackend {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant> {
        if credentials.password != "hunter2" {
            anyhow::bail!("Invalid credentials");
        }
        Ok(LoginGrant {
            grant: TokenGrant {
                access_token: "access-0".to_string(),
                refresh_token: Some("refresh-0".to_string()),
                access_ttl_secs: self.access_ttl_secs,
                refresh_ttl_secs: Some(3600),
            },
            user: None,
        })
    }

    async fn logout(&self, _refresh_token: &str) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout {
            anyhow::bail!("logout endpoint unreachable");
        }
        Ok(())
    }
}
