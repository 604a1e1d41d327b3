//! Single-flight token refresh.
//!
//! Any number of callers may discover an expired token at the same time;
//! they all share one refresh attempt. The attempt runs in its own task, so
//! it always completes (and updates or clears the session) even if every
//! caller waiting on it goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::refresh::{RefreshError, RefreshOperation};
use super::session::SessionState;

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

type Slot = Arc<Mutex<Option<InFlight>>>;

struct InFlight {
    id: u64,
    /// The refresh token this flight renews with
    refresh_token: Option<String>,
    outcome: SharedRefresh,
}

/// What the caller needs from the current token.
#[derive(Clone, Copy)]
enum Need<'a> {
    /// Any unexpired token will do
    Unexpired,
    /// An unexpired token other than the one the server just rejected
    Replacing(&'a str),
    /// A freshly issued token
    Fresh,
}

enum Flight {
    Settled(Result<String, RefreshError>),
    Pending(SharedRefresh),
}

impl Flight {
    async fn outcome(self) -> Result<String, RefreshError> {
        match self {
            Flight::Settled(result) => result,
            Flight::Pending(outcome) => outcome.await,
        }
    }
}

/// Clears the in-flight slot when the refresh task ends, however it ends.
///
/// If the task is torn down before settling (panic, runtime shutdown) the
/// session it was renewing is cleared too.
struct FlightGuard {
    slot: Slot,
    id: u64,
    refresh_token: Option<String>,
    state: Arc<SessionState>,
    settled: bool,
}

impl FlightGuard {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(flight = self.id, "Refresh ended without an outcome, clearing session");
            self.state.clear_if_refresh_token(self.refresh_token.as_deref());
        }
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|f| f.id) == Some(self.id) {
            *slot = None;
        }
    }
}

pub struct RefreshCoordinator<R> {
    state: Arc<SessionState>,
    refresher: Arc<R>,
    timeout: Duration,
    in_flight: Slot,
    next_id: AtomicU64,
}

impl<R: RefreshOperation> RefreshCoordinator<R> {
    pub fn new(state: Arc<SessionState>, refresher: Arc<R>, timeout: Duration) -> Self {
        Self {
            state,
            refresher,
            timeout,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// A bearer token fit to attach to an outgoing request.
    ///
    /// Returns the current token while it is unexpired; otherwise waits on
    /// the shared refresh. `None` means the session could not be renewed and
    /// has been cleared.
    pub async fn access_token(&self) -> Option<String> {
        self.join_or_start(Need::Unexpired).outcome().await.ok()
    }

    /// Refresh now, or join the refresh already running.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        self.join_or_start(Need::Fresh).outcome().await
    }

    /// Recover from the server rejecting `rejected` although it looked valid.
    ///
    /// If another caller already replaced that token, the replacement is
    /// returned without a new network call.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<String, RefreshError> {
        self.join_or_start(Need::Replacing(rejected)).outcome().await
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Check-and-set under the slot lock; the lock is released before anyone awaits.
    fn join_or_start(&self, need: Need<'_>) -> Flight {
        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let session = self.state.read();

        // A flight renewing a refresh token the session no longer holds belongs
        // to an earlier login; its outcome says nothing about this one
        if let Some(flight) = slot.as_ref() {
            if flight.refresh_token.as_deref() == session.refresh_token() {
                debug!(flight = flight.id, "Joining in-flight refresh");
                return Flight::Pending(flight.outcome.clone());
            }
            debug!(flight = flight.id, "In-flight refresh belongs to a replaced session");
        }

        if session.is_empty() {
            return Flight::Settled(Err(RefreshError::NoRefreshToken));
        }
        if let Some(token) = session.access_token() {
            if session.is_authenticated_at(self.state.now()) {
                match need {
                    Need::Unexpired => return Flight::Settled(Ok(token.to_string())),
                    Need::Replacing(rejected) if rejected != token => {
                        debug!("Rejected token already replaced");
                        return Flight::Settled(Ok(token.to_string()));
                    }
                    _ => {}
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(flight = id, "Starting refresh");

        let refresh_token = session.refresh_token().map(str::to_string);
        let guard = FlightGuard {
            slot: Arc::clone(&self.in_flight),
            id,
            refresh_token: refresh_token.clone(),
            state: Arc::clone(&self.state),
            settled: false,
        };
        let task = tokio::spawn(run_refresh(
            Arc::clone(&self.state),
            Arc::clone(&self.refresher),
            self.timeout,
            guard,
        ));
        let outcome = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RefreshError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            refresh_token,
            outcome: outcome.clone(),
        });
        Flight::Pending(outcome)
    }
}

async fn run_refresh<R: RefreshOperation>(
    state: Arc<SessionState>,
    refresher: Arc<R>,
    timeout: Duration,
    mut guard: FlightGuard,
) -> Result<String, RefreshError> {
    let result = attempt(&state, refresher.as_ref(), guard.refresh_token.as_deref(), timeout).await;

    match &result {
        Ok(_) => info!(flight = guard.id, "Access token refreshed"),
        Err(e) if e.clears_session() => {
            if state.clear_if_refresh_token(guard.refresh_token.as_deref()) {
                warn!(flight = guard.id, error = %e, "Refresh failed, session cleared");
            } else {
                debug!(flight = guard.id, error = %e, "Refresh failed after the session was replaced");
            }
        }
        Err(e) => debug!(flight = guard.id, error = %e, "Refresh result discarded"),
    }

    guard.settle();
    result
}

async fn attempt<R: RefreshOperation>(
    state: &SessionState,
    refresher: &R,
    refresh_token: Option<&str>,
    timeout: Duration,
) -> Result<String, RefreshError> {
    let refresh_token = refresh_token.ok_or(RefreshError::NoRefreshToken)?;
    let session = state.read();
    if session.refresh_token() != Some(refresh_token) {
        return Err(RefreshError::Superseded);
    }
    if session.is_refresh_expired_at(state.now()) {
        return Err(RefreshError::RefreshExpired);
    }

    let grant = match tokio::time::timeout(timeout, refresher.refresh(refresh_token)).await {
        Ok(result) => result?,
        Err(_) => return Err(RefreshError::Timeout),
    };

    let access_token = grant.access_token.clone();
    if state.update_if_refresh_token(refresh_token, grant.into()) {
        Ok(access_token)
    } else {
        Err(RefreshError::Superseded)
    }
}
