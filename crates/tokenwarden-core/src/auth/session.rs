use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::clock::Clock;
use crate::models::UserSummary;
use crate::storage::SessionStorage;

/// Milliseconds subtracted from every access-token lifetime so a token is
/// never presented at the exact instant the server expires it.
pub const DEFAULT_SAFETY_BUFFER_MS: u64 = 5_000;

/// Default lead time before expiry at which the scheduler renews.
pub const DEFAULT_REFRESH_LEAD_SECS: u64 = 60;

/// Default upper bound on a single refresh round-trip.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 30;

/// Server-supplied lifetimes are clamped to this many seconds (100 years).
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Tunables shared by the session store, the scheduler and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub safety_buffer: StdDuration,
    pub refresh_lead: StdDuration,
    pub refresh_timeout: StdDuration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            safety_buffer: StdDuration::from_millis(DEFAULT_SAFETY_BUFFER_MS),
            refresh_lead: StdDuration::from_secs(DEFAULT_REFRESH_LEAD_SECS),
            refresh_timeout: StdDuration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
        }
    }
}

/// The persisted credential record.
///
/// `access_token` and `expires_at` are always set or cleared together; the
/// fields are private so the pairing cannot be broken from outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_expires_at: Option<DateTime<Utc>>,
    user: Option<UserSummary>,
}

/// A new access token together with its server-supplied lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub token: String,
    pub ttl_secs: u64,
}

/// A partial session write. Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub access: Option<AccessGrant>,
    pub refresh_token: Option<String>,
    pub refresh_ttl_secs: Option<u64>,
    pub user: Option<UserSummary>,
}

impl SessionUpdate {
    pub fn access(token: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            access: Some(AccessGrant {
                token: token.into(),
                ttl_secs,
            }),
            ..Self::default()
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>, ttl_secs: Option<u64>) -> Self {
        self.refresh_token = Some(token.into());
        self.refresh_ttl_secs = ttl_secs;
        self
    }

    pub fn with_user(mut self, user: UserSummary) -> Self {
        self.user = Some(user);
        self
    }
}

impl Session {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        self.refresh_expires_at
    }

    pub fn user(&self) -> Option<&UserSummary> {
        self.user.as_ref()
    }

    /// True for a cleared or never-authenticated session
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Token and expiry are either both present or both absent
    pub fn is_consistent(&self) -> bool {
        self.access_token.is_some() == self.expires_at.is_some()
    }

    pub fn is_authenticated_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }

    /// An absent access token counts as expired.
    pub fn is_token_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_authenticated_at(now)
    }

    /// True when there is no refresh token, or it has passed its expiry.
    pub fn is_refresh_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.refresh_token, self.refresh_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => now >= expires_at,
            (Some(_), None) => false,
        }
    }

    /// Whether anything in this session can still be used, now or after a refresh
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        if self.refresh_token.is_some() {
            !self.is_refresh_expired_at(now)
        } else {
            self.is_authenticated_at(now)
        }
    }

    /// Pure merge of `update` into this session.
    ///
    /// Expiry instants are derived here from the supplied lifetimes:
    /// `expires_at = now + ttl - safety_buffer`.
    pub fn merged(&self, update: SessionUpdate, now: DateTime<Utc>, safety_buffer: Duration) -> Session {
        let mut next = self.clone();

        if let Some(access) = update.access {
            // A buffer reaching past the representable range leaves the token born expired
            let expires_at = after(now, access.ttl_secs)
                .checked_sub_signed(safety_buffer)
                .unwrap_or(now);
            next.expires_at = Some(expires_at);
            next.access_token = Some(access.token);
        }

        match (update.refresh_token, update.refresh_ttl_secs) {
            (Some(token), ttl) => {
                next.refresh_token = Some(token);
                next.refresh_expires_at = ttl.map(|ttl| after(now, ttl));
            }
            (None, Some(ttl)) if next.refresh_token.is_some() => {
                next.refresh_expires_at = Some(after(now, ttl));
            }
            (None, _) => {}
        }

        if let Some(user) = update.user {
            next.user = Some(user);
        }

        next
    }
}

/// `now` plus a server-supplied lifetime, clamped to `MAX_TTL_SECS`
fn after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let ttl = Duration::seconds(i64::try_from(secs).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS));
    now.checked_add_signed(ttl).unwrap_or(now)
}

/// The process-wide session store.
///
/// Holds the current [`Session`] behind a watch channel so observers
/// (scheduler, guard) are notified of every effective change. All writes
/// serialize through one lock, merge, publish, then persist; readers always
/// get a complete snapshot.
pub struct SessionState {
    tx: watch::Sender<Session>,
    storage: Box<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    safety_buffer: Duration,
    write_lock: Mutex<()>,
}

impl SessionState {
    /// Build the store and rehydrate it from `storage`.
    ///
    /// A stored snapshot that breaks the token/expiry pairing, or that holds
    /// nothing usable anymore, is discarded and wiped from storage.
    pub fn open(storage: Box<dyn SessionStorage>, clock: Arc<dyn Clock>, config: &SessionConfig) -> Self {
        let now = clock.now();
        let restored = match storage.load() {
            Ok(Some(session)) if session.is_empty() => Session::default(),
            Ok(Some(session)) if !session.is_consistent() => {
                warn!("Discarding stored session with mismatched token and expiry");
                wipe(storage.as_ref());
                Session::default()
            }
            Ok(Some(session)) if !session.is_usable_at(now) => {
                info!("Stored session has expired, starting signed out");
                wipe(storage.as_ref());
                Session::default()
            }
            Ok(Some(session)) => {
                debug!(has_user = session.user.is_some(), "Session rehydrated from storage");
                session
            }
            Ok(None) => Session::default(),
            Err(e) => {
                warn!(error = %e, "Failed to load stored session");
                Session::default()
            }
        };

        let (tx, _rx) = watch::channel(restored);
        Self {
            tx,
            storage,
            clock,
            safety_buffer: Duration::from_std(config.safety_buffer).unwrap_or_else(|_| Duration::zero()),
            write_lock: Mutex::new(()),
        }
    }

    /// A consistent snapshot of the current session
    pub fn read(&self) -> Session {
        self.tx.borrow().clone()
    }

    /// Observe every effective change to the session
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Merge a partial update and persist the result
    pub fn set(&self, update: SessionUpdate) {
        let now = self.now();
        self.commit(|current| Some(current.merged(update, now, self.safety_buffer)));
    }

    /// Start over from an empty session with `update` applied, as one write
    pub fn replace(&self, update: SessionUpdate) {
        let now = self.now();
        self.commit(|_| Some(Session::default().merged(update, now, self.safety_buffer)));
    }

    /// Merge `update` only while the session still holds `expected` as its
    /// refresh token. Returns false (and writes nothing) otherwise.
    pub fn update_if_refresh_token(&self, expected: &str, update: SessionUpdate) -> bool {
        let now = self.now();
        let mut matched = false;
        self.commit(|current| {
            if current.refresh_token.as_deref() != Some(expected) {
                return None;
            }
            matched = true;
            Some(current.merged(update, now, self.safety_buffer))
        });
        matched
    }

    /// Drop every credential. Idempotent: clearing an empty session notifies no one.
    pub fn clear(&self) {
        self.clear_if(|_| true);
    }

    /// Clear the session only if `pred` holds for it.
    ///
    /// `pred` sees the session as it is under the write lock, so no other
    /// write can land between the check and the clear. It is always called,
    /// even when the session is already empty. Returns true if anything was
    /// cleared.
    pub fn clear_if(&self, pred: impl FnOnce(&Session) -> bool) -> bool {
        let cleared = self.commit(|current| (pred(current) && !current.is_empty()).then(Session::default));
        if cleared {
            info!("Session cleared");
        }
        cleared
    }

    /// Clear the session only while it still holds `expected` as its refresh token
    pub fn clear_if_refresh_token(&self, expected: Option<&str>) -> bool {
        self.clear_if(|current| current.refresh_token.as_deref() == expected)
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().access_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_authenticated_at(self.now())
    }

    pub fn is_token_expired(&self) -> bool {
        self.tx.borrow().is_token_expired_at(self.now())
    }

    pub fn is_refresh_expired(&self) -> bool {
        self.tx.borrow().is_refresh_expired_at(self.now())
    }

    /// Apply `f` under the write lock; publish and persist if the session changed
    fn commit(&self, f: impl FnOnce(&Session) -> Option<Session>) -> bool {
        let _write = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let changed = self.tx.send_if_modified(|current| match f(current) {
            Some(next) if next != *current => {
                *current = next;
                true
            }
            _ => false,
        });

        if changed {
            let snapshot = self.read();
            self.persist(&snapshot);
        }
        changed
    }

    fn persist(&self, session: &Session) {
        let result = if session.is_empty() {
            self.storage.clear()
        } else {
            self.storage.save(session)
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }
}

fn wipe(storage: &dyn SessionStorage) {
    if let Err(e) = storage.clear() {
        warn!(error = %e, "Failed to wipe stored session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn user() -> UserSummary {
        UserSummary {
            id: "7".to_string(),
            email: "ops@example.com".to_string(),
            name: Some("Ops".to_string()),
            avatar_url: None,
        }
    }

    fn state_with(storage: Arc<MemoryStorage>, clock: &ManualClock) -> SessionState {
        SessionState::open(Box::new(storage), Arc::new(clock.clone()), &SessionConfig::default())
    }

    fn setup() -> (SessionState, Arc<MemoryStorage>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let storage = Arc::new(MemoryStorage::new());
        (state_with(Arc::clone(&storage), &clock), storage, clock)
    }

    #[test]
    fn test_partial_merge_keeps_unsupplied_fields() {
        let (state, _, _) = setup();
        state.set(
            SessionUpdate::access("a1", 600)
                .with_refresh_token("r1", Some(3600))
                .with_user(user()),
        );

        state.set(SessionUpdate::access("a2", 600));

        let session = state.read();
        assert_eq!(session.access_token(), Some("a2"));
        assert_eq!(session.refresh_token(), Some("r1"));
        assert_eq!(session.user(), Some(&user()));
    }

    #[test]
    fn test_expiry_arithmetic_with_safety_buffer() {
        let (state, _, clock) = setup();
        let acquired = clock.now();

        state.set(SessionUpdate::access("a1", 60));

        assert_eq!(state.read().expires_at(), Some(acquired + Duration::milliseconds(55_000)));

        clock.set(acquired + Duration::milliseconds(54_999));
        assert!(!state.is_token_expired());
        assert!(state.is_authenticated());

        clock.set(acquired + Duration::milliseconds(55_000));
        assert!(state.is_token_expired());
        assert!(!state.is_authenticated());
    }

    #[test]
    fn test_access_token_and_expiry_move_together() {
        let (state, _, _) = setup();
        assert!(state.read().is_consistent());

        state.set(SessionUpdate::access("a1", 60));
        assert!(state.read().is_consistent());

        state.set(SessionUpdate::default().with_user(user()));
        assert!(state.read().is_consistent());

        state.clear();
        let session = state.read();
        assert!(session.is_consistent());
        assert!(session.access_token().is_none());
        assert!(session.expires_at().is_none());
    }

    #[test]
    fn test_refresh_ttl_applies_to_existing_token_only() {
        let (state, _, clock) = setup();
        let now = clock.now();

        // No refresh token yet: a bare TTL has nothing to attach to
        state.set(SessionUpdate {
            refresh_ttl_secs: Some(100),
            ..SessionUpdate::default()
        });
        assert!(state.read().refresh_expires_at().is_none());

        state.set(SessionUpdate::default().with_refresh_token("r1", None));
        assert!(state.read().refresh_expires_at().is_none());
        assert!(!state.is_refresh_expired());

        state.set(SessionUpdate {
            refresh_ttl_secs: Some(100),
            ..SessionUpdate::default()
        });
        assert_eq!(state.read().refresh_expires_at(), Some(now + Duration::seconds(100)));
    }

    #[test]
    fn test_refresh_expired_without_token() {
        let (state, _, clock) = setup();
        assert!(state.is_refresh_expired());

        state.set(SessionUpdate::access("a1", 60).with_refresh_token("r1", Some(120)));
        assert!(!state.is_refresh_expired());

        clock.advance(Duration::seconds(120));
        assert!(state.is_refresh_expired());
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let (state, storage, _) = setup();

        state.set(SessionUpdate::access("a1", 60).with_refresh_token("r1", Some(3600)));
        let stored = storage.snapshot().expect("session should be persisted");
        assert_eq!(stored, state.read());

        state.clear();
        assert!(storage.snapshot().is_none());
    }

    #[test]
    fn test_rehydrates_from_storage() {
        let clock = ManualClock::new(Utc::now());
        let storage = Arc::new(MemoryStorage::new());
        {
            let state = state_with(Arc::clone(&storage), &clock);
            state.set(SessionUpdate::access("a1", 600).with_refresh_token("r1", Some(3600)).with_user(user()));
        }

        let state = state_with(storage, &clock);
        assert_eq!(state.access_token().as_deref(), Some("a1"));
        assert_eq!(state.read().user(), Some(&user()));
        assert!(state.is_authenticated());
    }

    #[test]
    fn test_rehydrate_discards_expired_refresh_token() {
        let clock = ManualClock::new(Utc::now());
        let storage = Arc::new(MemoryStorage::new());
        {
            let state = state_with(Arc::clone(&storage), &clock);
            state.set(SessionUpdate::access("a1", 600).with_refresh_token("r1", Some(60)));
        }

        clock.advance(Duration::seconds(61));
        let state = state_with(Arc::clone(&storage), &clock);

        assert!(state.read().is_empty());
        assert!(storage.snapshot().is_none());
    }

    #[test]
    fn test_rehydrate_keeps_expired_access_token_with_live_refresh_token() {
        let clock = ManualClock::new(Utc::now());
        let storage = Arc::new(MemoryStorage::new());
        {
            let state = state_with(Arc::clone(&storage), &clock);
            state.set(SessionUpdate::access("a1", 60).with_refresh_token("r1", None));
        }

        clock.advance(Duration::minutes(10));
        let state = state_with(storage, &clock);

        assert!(state.is_token_expired());
        assert_eq!(state.read().refresh_token(), Some("r1"));
    }

    #[test]
    fn test_rehydrate_discards_inconsistent_snapshot() {
        let clock = ManualClock::new(Utc::now());
        let json = r#"{"accessToken":"a1","refreshToken":"r1","expiresAt":null,"refreshExpiresAt":null,"user":null}"#;
        let broken: Session = serde_json::from_str(json).expect("Failed to parse session JSON");
        let storage = Arc::new(MemoryStorage::with_session(broken));

        let state = state_with(Arc::clone(&storage), &clock);

        assert!(state.read().is_empty());
        assert!(storage.snapshot().is_none());
    }

    #[test]
    fn test_clear_on_empty_session_does_not_notify() {
        let (state, _, _) = setup();
        let mut rx = state.subscribe();

        state.clear();
        assert!(!rx.has_changed().expect("sender alive"));

        state.set(SessionUpdate::access("a1", 60));
        assert!(rx.has_changed().expect("sender alive"));
        rx.borrow_and_update();

        state.clear();
        assert!(rx.has_changed().expect("sender alive"));
    }

    #[test]
    fn test_update_if_refresh_token_rejects_replaced_session() {
        let (state, _, _) = setup();
        state.set(SessionUpdate::access("a1", 60).with_refresh_token("r1", None));

        assert!(state.update_if_refresh_token("r1", SessionUpdate::access("a2", 60)));
        assert_eq!(state.access_token().as_deref(), Some("a2"));

        state.clear();
        assert!(!state.update_if_refresh_token("r1", SessionUpdate::access("a3", 60)));
        assert!(state.read().is_empty());
    }

    #[test]
    fn test_clear_if_refresh_token_keeps_newer_session() {
        let (state, storage, _) = setup();
        state.set(SessionUpdate::access("a1", 60).with_refresh_token("r1", None));
        state.replace(SessionUpdate::access("a2", 60).with_refresh_token("r2", None));

        assert!(!state.clear_if_refresh_token(Some("r1")));
        assert_eq!(state.read().refresh_token(), Some("r2"));
        assert!(storage.snapshot().is_some());

        assert!(state.clear_if_refresh_token(Some("r2")));
        assert!(state.read().is_empty());
        assert!(storage.snapshot().is_none());
    }

    #[test]
    fn test_clear_if_checks_the_session_it_clears() {
        let (state, _, _) = setup();
        let mut seen = None;

        // The predicate is still consulted for an empty session
        assert!(!state.clear_if(|current| {
            seen = Some(current.is_empty());
            true
        }));
        assert_eq!(seen, Some(true));

        state.set(SessionUpdate::access("a1", 60));
        assert!(!state.clear_if(|current| current.access_token().is_none()));
        assert_eq!(state.access_token().as_deref(), Some("a1"));
    }

    #[test]
    fn test_oversized_safety_buffer_does_not_panic() {
        let now = Utc::now();
        let session = Session::default().merged(
            SessionUpdate::access("a1", 60).with_refresh_token("r1", Some(u64::MAX)),
            now,
            Duration::days(100_000_000),
        );

        assert_eq!(session.expires_at(), Some(now));
        assert!(session.is_token_expired_at(now));
        assert!(!session.is_refresh_expired_at(now));
    }

    #[test]
    fn test_replace_drops_previous_fields() {
        let (state, storage, _) = setup();
        state.set(SessionUpdate::access("a1", 60).with_refresh_token("r1", None).with_user(user()));

        state.replace(SessionUpdate::access("a2", 60));

        let session = state.read();
        assert_eq!(session.access_token(), Some("a2"));
        assert!(session.refresh_token().is_none());
        assert!(session.user().is_none());
        assert_eq!(storage.snapshot(), Some(session));
    }

    #[test]
    fn test_short_ttl_is_immediately_expired() {
        let (state, _, _) = setup();
        state.set(SessionUpdate::access("a1", 3));
        assert!(state.access_token().is_some());
        assert!(state.is_token_expired());
    }
}
