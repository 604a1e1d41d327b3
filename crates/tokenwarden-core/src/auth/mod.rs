//! Session and token lifecycle.
//!
//! This module provides:
//! - `SessionState`: the persisted credential record with partial-merge updates
//! - `RefreshCoordinator`: single-flight refresh shared by every caller
//! - `ProactiveScheduler`: renews the access token ahead of expiry
//! - `SessionGuard`: the authorized/redirect check for protected views
//! - `SessionManager`: wires the above to an `AuthBackend`
//!
//! Every refresh, timer-driven or request-driven, goes through the
//! coordinator, so at most one refresh call is outstanding at a time.

pub mod clock;
pub mod coordinator;
pub mod guard;
pub mod manager;
pub mod refresh;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use coordinator::RefreshCoordinator;
pub use guard::{GuardDecision, SessionGuard};
pub use manager::SessionManager;
pub use refresh::{AuthBackend, Credentials, LoginGrant, RefreshError, RefreshOperation, TokenGrant};
pub use scheduler::{plan_refresh, ProactiveScheduler, RefreshPlan, SchedulerHandle};
pub use session::{AccessGrant, Session, SessionConfig, SessionState, SessionUpdate};
