//! Timer-driven renewal ahead of expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::RefreshCoordinator;
use super::refresh::RefreshOperation;
use super::session::{Session, SessionState};

/// Minimum spacing between two proactive refreshes. Keeps a token whose
/// lifetime is shorter than the lead from being renewed back-to-back.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// What the scheduler should do for a given session snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// No access token held; wait for one to appear
    Idle,
    /// Nothing to renew with: drop the session
    Expire,
    /// Fire a refresh after this delay (zero means now)
    FireIn(Duration),
}

/// Decide the next step: fire `lead` before `expires_at`, immediately if that is already past.
pub fn plan_refresh(session: &Session, now: DateTime<Utc>, lead: Duration) -> RefreshPlan {
    let Some(expires_at) = session.expires_at() else {
        return RefreshPlan::Idle;
    };
    if session.is_refresh_expired_at(now) {
        return RefreshPlan::Expire;
    }

    // A lead reaching past the representable range means "already due"
    let fire_at = chrono::Duration::from_std(lead)
        .ok()
        .and_then(|lead| expires_at.checked_sub_signed(lead));
    let delay = match fire_at {
        Some(fire_at) => (fire_at - now).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    };
    RefreshPlan::FireIn(delay)
}

/// Keeps at most one refresh timer armed against the current session.
pub struct ProactiveScheduler<R> {
    state: Arc<SessionState>,
    coordinator: Arc<RefreshCoordinator<R>>,
    lead: Duration,
}

impl<R: RefreshOperation> ProactiveScheduler<R> {
    pub fn new(state: Arc<SessionState>, coordinator: Arc<RefreshCoordinator<R>>, lead: Duration) -> Self {
        Self {
            state,
            coordinator,
            lead,
        }
    }

    /// Spawn the timer loop. It runs until the returned handle is shut down or dropped.
    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        SchedulerHandle {
            cancel,
            task: Some(task),
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut rx = self.state.subscribe();
        let mut last_fired: Option<Instant> = None;
        let mut warned_short_ttl = false;
        debug!(lead_secs = self.lead.as_secs(), "Refresh scheduler started");

        loop {
            let session = rx.borrow_and_update().clone();

            match plan_refresh(&session, self.state.now(), self.lead) {
                RefreshPlan::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = rx.changed() => if changed.is_err() { break },
                    }
                }
                RefreshPlan::Expire => {
                    info!("No usable refresh token, ending session");
                    self.state.clear();
                }
                RefreshPlan::FireIn(mut delay) => {
                    if let Some(last) = last_fired {
                        let earliest = (last + MIN_REFRESH_INTERVAL).saturating_duration_since(Instant::now());
                        if delay < earliest {
                            if !warned_short_ttl {
                                warn!(
                                    lead_secs = self.lead.as_secs(),
                                    "Access token lifetime is shorter than the refresh lead, renewing at the minimum interval"
                                );
                                warned_short_ttl = true;
                            }
                            delay = earliest;
                        }
                    }
                    debug!(delay_ms = delay.as_millis() as u64, "Refresh timer armed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        // Any session change re-plans; the pending sleep is dropped
                        changed = rx.changed() => if changed.is_err() { break },
                        _ = tokio::time::sleep(delay) => {
                            info!("Proactive refresh firing");
                            last_fired = Some(Instant::now());
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                // Failures already cleared the session inside the coordinator
                                result = self.coordinator.refresh() => if let Err(e) = result {
                                    warn!(error = %e, "Proactive refresh failed");
                                },
                            }
                        }
                    }
                }
            }
        }

        debug!("Refresh scheduler stopped");
    }
}

/// Owner of a running scheduler. Dropping it cancels the pending timer.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Cancel the timer and wait for the loop to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Refresh scheduler task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
