//! Boundary check for protected views.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use super::session::{Session, SessionState};

/// Outcome of one guard evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    /// Protected content may be shown
    pub authorized: bool,
    /// Navigate to the entry point. Set once per transition into the
    /// unauthorized state, not on every evaluation.
    pub redirect: bool,
}

/// The parts of a session that decide authorization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AuthFields {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: Option<String>,
}

impl From<&Session> for AuthFields {
    fn from(session: &Session) -> Self {
        Self {
            access_token: session.access_token().map(str::to_string),
            expires_at: session.expires_at(),
            refresh_token: session.refresh_token().map(str::to_string),
        }
    }
}

pub struct SessionGuard {
    state: Arc<SessionState>,
    rx: watch::Receiver<Session>,
    seen: AuthFields,
    authorized: Option<bool>,
}

impl SessionGuard {
    pub fn new(state: Arc<SessionState>) -> Self {
        let rx = state.subscribe();
        let seen = AuthFields::from(&*rx.borrow());
        Self {
            state,
            rx,
            seen,
            authorized: None,
        }
    }

    /// Result of the most recent evaluation; false before the first one
    pub fn is_authorized(&self) -> bool {
        self.authorized.unwrap_or(false)
    }

    /// Check the session now. An unauthorized session is cleared.
    ///
    /// The check and the clear happen as one write, so a login landing
    /// concurrently is either judged by this evaluation or left untouched
    /// for the next one.
    pub fn evaluate(&mut self) -> GuardDecision {
        let now = self.state.now();
        let mut authorized = false;
        let mut fields = AuthFields::default();
        self.state.clear_if(|current| {
            authorized = current.is_authenticated_at(now);
            if authorized {
                fields = AuthFields::from(current);
            }
            !authorized
        });

        let redirect = !authorized && self.authorized != Some(false);
        if redirect {
            info!("Session not authorized, signalling redirect");
        }

        self.authorized = Some(authorized);
        self.seen = fields;
        GuardDecision { authorized, redirect }
    }

    /// Wait for an authentication-relevant change, or for the current token
    /// to reach its expiry, then evaluate.
    ///
    /// Returns `None` once the session store has been dropped.
    pub async fn next_decision(&mut self) -> Option<GuardDecision> {
        loop {
            let expiry = self
                .seen
                .expires_at
                .filter(|_| self.authorized == Some(true))
                .map(|at| (at - self.state.now()).to_std().unwrap_or(std::time::Duration::ZERO));

            let expired = match expiry {
                Some(remaining) => {
                    tokio::select! {
                        changed = self.rx.changed() => { changed.ok()?; false }
                        _ = tokio::time::sleep(remaining) => true,
                    }
                }
                None => {
                    self.rx.changed().await.ok()?;
                    false
                }
            };

            let current = AuthFields::from(&*self.rx.borrow());
            if expired || current != self.seen || self.authorized.is_none() {
                return Some(self.evaluate());
            }
        }
    }
}
