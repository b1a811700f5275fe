//! # Session Aggregation
//!
//! Groups bursts of units from one originator into a single [`Session`].
//! A session stays open while new units keep arriving within the inactivity
//! window; once the window elapses it must be flushed before the originator
//! can start a new one.
//!
//! Two backends implement [`SessionStore`]:
//! - [`InMemorySessionStore`]: per-originator async locks inside the process
//! - [`KvSessionStore`]: optimistic compare-and-set against a shared
//!   [`KeyValueStore`], for deployments with several replicas
//!
//! [`select_session_store`] picks between them based on whether a key-value
//! store was configured.

use crate::error::SessionError;
use async_trait::async_trait;
use bridge_traits::{
    kv::KeyValueStore,
    origin::InboundItem,
    time::Clock,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SessionError>;

// ============================================================================
// Units and Sessions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, enough to tell notes of one second apart
    pub fn short(&self) -> String {
        let mut short = self.0.simple().to_string();
        short.truncate(8);
        short
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound payload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub originator_id: String,
    pub name: String,
    pub payload: Bytes,
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Unit {
    pub fn new(
        originator_id: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<Bytes>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UnitId::new(),
            originator_id: originator_id.into(),
            name: name.into(),
            payload: payload.into(),
            mime_type: None,
            created_at,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl From<InboundItem> for Unit {
    fn from(item: InboundItem) -> Self {
        Self {
            id: UnitId::new(),
            originator_id: item.originator_id,
            name: item.name,
            payload: item.payload,
            mime_type: item.mime_type,
            created_at: item.received_at,
        }
    }
}

/// Ordered units from one originator plus the activity bookkeeping that
/// decides when the session expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub originator_id: String,
    pub units: Vec<Unit>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub window: Duration,
}

impl Session {
    /// Opens a session containing only `unit`.
    pub fn start(unit: Unit, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            originator_id: unit.originator_id.clone(),
            units: vec![unit],
            started_at: now,
            last_activity: now,
            window,
        }
    }

    /// Appends `unit` and refreshes the activity timestamp.
    pub fn append(&mut self, unit: Unit, now: DateTime<Utc>) {
        self.units.push(unit);
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// A session is live only while `now - last_activity < window`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.last_activity).to_std() {
            Ok(elapsed) => elapsed >= self.window,
            // Clock went backwards relative to the last unit
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.units.iter().map(Unit::size).sum()
    }
}

/// Outcome of [`SessionStore::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    /// The live session after the unit was recorded
    pub session: Session,
    /// An expired session that `add` replaced, returned so it can be processed
    pub flushed: Option<Session>,
}

impl SessionUpdate {
    /// Whether the added unit opened a new session.
    pub fn started_new(&self) -> bool {
        self.session.len() == 1
    }
}

// ============================================================================
// SessionStore trait
// ============================================================================

/// Time-windowed aggregation keyed by originator.
///
/// Updates for one originator are applied atomically; different originators
/// never block each other.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Records `unit`, appending to the live session or starting a new one.
    async fn add(&self, originator_id: &str, unit: Unit) -> Result<SessionUpdate>;

    /// Returns and clears the session if it has expired at `now`.
    async fn close_expired_if_any(
        &self,
        originator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// Returns and clears the session regardless of its age.
    async fn end_session(&self, originator_id: &str) -> Result<Option<Session>>;

    /// Read-only view of the current session.
    async fn peek(&self, originator_id: &str) -> Result<Option<Session>>;

    fn window(&self) -> Duration;
}

/// Chooses the shared backend when a key-value store is available.
pub fn select_session_store(
    kv: Option<Arc<dyn KeyValueStore>>,
    window: Duration,
    clock: Arc<dyn Clock>,
) -> Arc<dyn SessionStore> {
    match kv {
        Some(kv) => {
            debug!(window_secs = window.as_secs(), "Using key-value session store");
            Arc::new(KvSessionStore::new(kv, window, clock))
        }
        None => {
            debug!(window_secs = window.as_secs(), "Using in-memory session store");
            Arc::new(InMemorySessionStore::new(window, clock))
        }
    }
}

/// Applies one unit to the current slot contents.
fn apply_unit(
    current: Option<Session>,
    unit: Unit,
    now: DateTime<Utc>,
    window: Duration,
) -> SessionUpdate {
    match current {
        Some(mut session) if !session.is_expired(now) => {
            session.append(unit, now);
            SessionUpdate {
                session,
                flushed: None,
            }
        }
        expired => SessionUpdate {
            session: Session::start(unit, now, window),
            flushed: expired,
        },
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

type Slot = Arc<tokio::sync::Mutex<Option<Session>>>;

/// Process-local store with one async lock per originator.
///
/// The outer map lock is held only long enough to look up or create a slot.
pub struct InMemorySessionStore {
    window: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemorySessionStore {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, originator_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(originator_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    fn existing_slot(&self, originator_id: &str) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(originator_id).cloned()
    }

    /// Drops the slot if it is empty and nobody else holds it.
    fn prune(&self, originator_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let removable = slots.get(originator_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|guard| guard.is_none()).unwrap_or(false)
        });
        if removable {
            slots.remove(originator_id);
        }
    }

    /// Number of originators with a slot, live or not.
    pub fn tracked_originators(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn add(&self, originator_id: &str, unit: Unit) -> Result<SessionUpdate> {
        let slot = self.slot(originator_id);
        let mut guard = slot.lock().await;
        let now = self.clock.now();

        let update = apply_unit(guard.take(), unit, now, self.window);
        if let Some(flushed) = &update.flushed {
            warn!(
                originator_id,
                units = flushed.len(),
                "Replaced expired session that was never closed"
            );
        }
        *guard = Some(update.session.clone());
        Ok(update)
    }

    async fn close_expired_if_any(
        &self,
        originator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let Some(slot) = self.existing_slot(originator_id) else {
            return Ok(None);
        };

        let closed = {
            let mut guard = slot.lock().await;
            let expired = guard.as_ref().is_some_and(|s| s.is_expired(now));
            if expired {
                guard.take()
            } else {
                None
            }
        };
        drop(slot);

        if closed.is_some() {
            self.prune(originator_id);
        }
        Ok(closed)
    }

    async fn end_session(&self, originator_id: &str) -> Result<Option<Session>> {
        let Some(slot) = self.existing_slot(originator_id) else {
            return Ok(None);
        };

        let closed = slot.lock().await.take();
        drop(slot);

        self.prune(originator_id);
        Ok(closed)
    }

    async fn peek(&self, originator_id: &str) -> Result<Option<Session>> {
        match self.existing_slot(originator_id) {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Ok(None),
        }
    }

    fn window(&self) -> Duration {
        self.window
    }
}

// ============================================================================
// Key-value backend
// ============================================================================

const DEFAULT_KEY_PREFIX: &str = "notes:session:";
const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// Entry lifetime in the shared store: `max(window * 2, window + 60s)`.
pub fn session_ttl(window: Duration) -> Duration {
    window
        .saturating_mul(2)
        .max(window.saturating_add(Duration::from_secs(60)))
}

/// Shared store using optimistic compare-and-set per originator key.
pub struct KvSessionStore {
    kv: Arc<dyn KeyValueStore>,
    window: Duration,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    max_cas_attempts: u32,
}

impl KvSessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            window,
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    fn key(&self, originator_id: &str) -> String {
        format!("{}{}", self.key_prefix, originator_id)
    }

    async fn load(&self, key: &str) -> Result<Option<(Session, u64)>> {
        match self.kv.get(key).await? {
            Some(entry) => {
                let session: Session = serde_json::from_slice(&entry.value)?;
                Ok(Some((session, entry.version)))
            }
            None => Ok(None),
        }
    }

    /// Deletes the entry when `should_take` accepts the stored session.
    async fn take_if<F>(&self, originator_id: &str, should_take: F) -> Result<Option<Session>>
    where
        F: Fn(&Session) -> bool + Send + Sync,
    {
        let key = self.key(originator_id);

        for attempt in 1..=self.max_cas_attempts {
            let Some((session, version)) = self.load(&key).await? else {
                return Ok(None);
            };
            if !should_take(&session) {
                return Ok(None);
            }
            if self.kv.compare_and_delete(&key, version).await? {
                return Ok(Some(session));
            }
            debug!(originator_id, attempt, "Session delete lost a race, retrying");
        }

        Err(SessionError::Contention {
            originator_id: originator_id.to_string(),
            attempts: self.max_cas_attempts,
        })
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn add(&self, originator_id: &str, unit: Unit) -> Result<SessionUpdate> {
        let key = self.key(originator_id);
        let ttl = session_ttl(self.window);

        for attempt in 1..=self.max_cas_attempts {
            let current = self.load(&key).await?;
            let expected_version = current.as_ref().map(|(_, version)| *version);
            let now = self.clock.now();

            let update = apply_unit(
                current.map(|(session, _)| session),
                unit.clone(),
                now,
                self.window,
            );
            let encoded = serde_json::to_vec(&update.session)?;

            if self
                .kv
                .compare_and_set(&key, encoded, expected_version, ttl)
                .await?
            {
                if let Some(flushed) = &update.flushed {
                    warn!(
                        originator_id,
                        units = flushed.len(),
                        "Replaced expired session that was never closed"
                    );
                }
                return Ok(update);
            }
            debug!(originator_id, attempt, "Session update lost a race, retrying");
        }

        Err(SessionError::Contention {
            originator_id: originator_id.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    async fn close_expired_if_any(
        &self,
        originator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        self.take_if(originator_id, |session| session.is_expired(now))
            .await
    }

    async fn end_session(&self, originator_id: &str) -> Result<Option<Session>> {
        self.take_if(originator_id, |_| true).await
    }

    async fn peek(&self, originator_id: &str) -> Result<Option<Session>> {
        Ok(self
            .load(&self.key(originator_id))
            .await?
            .map(|(session, _)| session))
    }

    fn window(&self) -> Duration {
        self.window
    }
}
