//! # Event Bus System
//!
//! Typed events for the notes core, broadcast over `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: one enum per domain (sessions, pipeline, sync)
//! - **EventBus**: central broadcast channel
//! - **EventStream**: receiver wrapper with filtering
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────┐  subscribe  ┌─────────────────┐
//! │ SessionStore ├────────>│          ├────────────>│ chat-bot replies│
//! ├──────────────┤         │ EventBus │             ├─────────────────┤
//! │ Pipeline     ├────────>│          ├────────────>│ status dashboard│
//! ├──────────────┤         │          │             └─────────────────┘
//! │ Reconciler   ├────────>│          │
//! └──────────────┘         └──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
//!
//! let event_bus = EventBus::new(100);
//! let _subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Session(SessionEvent::Started {
//!         originator_id: "chat-42".to_string(),
//!     }))
//!     .ok();
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep reading.
//! - **`RecvError::Closed`**: every sender was dropped; treat as shutdown.
//!
//! Emitting with no subscribers returns an error; producers ignore it with
//! `.ok()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Session(SessionEvent),
    Pipeline(PipelineEvent),
    Sync(SyncEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Session(e) => e.description(),
            CoreEvent::Pipeline(e) => e.description(),
            CoreEvent::Sync(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Pipeline(PipelineEvent::UnitFailed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::ConflictDetected { .. }) => EventSeverity::Warning,
            CoreEvent::Pipeline(PipelineEvent::UnitProcessed { warnings, .. }) if *warnings > 0 => {
                EventSeverity::Warning
            }
            CoreEvent::Pipeline(PipelineEvent::UnitProcessed { .. }) => EventSeverity::Info,
            CoreEvent::Pipeline(PipelineEvent::BatchCompleted { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Session Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    /// First unit from an originator opened a session.
    Started { originator_id: String },
    /// A unit was appended to a live session.
    UnitAdded {
        originator_id: String,
        /// Units in the session after the append.
        unit_count: usize,
    },
    /// A session was closed and handed to the pipeline.
    Flushed {
        originator_id: String,
        unit_count: usize,
        /// `"expired"` or `"ended"`.
        reason: String,
    },
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::Started { .. } => "Session started",
            SessionEvent::UnitAdded { .. } => "Unit added to session",
            SessionEvent::Flushed { .. } => "Session flushed",
        }
    }
}

// ============================================================================
// Pipeline Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// A session or unit was published.
    UnitProcessed {
        originator_id: String,
        /// Version control path of the published note.
        note_path: String,
        pages: usize,
        duration_ms: u64,
        /// Number of non-fatal warnings (backup failures, placeholders).
        warnings: usize,
    },
    /// A mandatory stage failed.
    UnitFailed {
        originator_id: String,
        stage: String,
        message: String,
    },
    BatchCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    fn description(&self) -> &str {
        match self {
            PipelineEvent::UnitProcessed { .. } => "Note published",
            PipelineEvent::UnitFailed { .. } => "Note processing failed",
            PipelineEvent::BatchCompleted { .. } => "Batch completed",
        }
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events related to attachment folder reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// Reconciliation run started.
    Started {
        run_id: String,
        /// Triggered manually rather than by the timer.
        manual: bool,
    },
    /// Reconciliation run finished.
    Completed {
        run_id: String,
        files_pushed: u64,
        files_pulled: u64,
        files_deleted: u64,
        conflicts: u64,
        duration_ms: u64,
    },
    /// Reconciliation run aborted with an error.
    Failed {
        run_id: String,
        message: String,
        /// Whether the next tick will retry.
        recoverable: bool,
    },
    /// A path changed on both sides since the last sync.
    ConflictDetected {
        path: String,
        /// Strategy that will be (or was) applied.
        strategy: String,
        resolved: bool,
    },
    /// SyncStatus moved between lifecycle states.
    StatusChanged { from: String, to: String },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::Completed { .. } => "Sync completed successfully",
            SyncEvent::Failed { .. } => "Sync failed",
            SyncEvent::ConflictDetected { .. } => "Sync conflict detected",
            SyncEvent::StatusChanged { .. } => "Sync status changed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let sync_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Sync(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn flushed(originator: &str) -> CoreEvent {
        CoreEvent::Session(SessionEvent::Flushed {
            originator_id: originator.to_string(),
            unit_count: 3,
            reason: "expired".to_string(),
        })
    }

    fn sync_completed() -> CoreEvent {
        CoreEvent::Sync(SyncEvent::Completed {
            run_id: "run-1".to_string(),
            files_pushed: 4,
            files_pulled: 1,
            files_deleted: 0,
            conflicts: 1,
            duration_ms: 820,
        })
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.emit(flushed("u1")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = flushed("u1");
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream =
            EventStream::new(bus.subscribe()).filter(|event| matches!(event, CoreEvent::Sync(_)));

        bus.emit(flushed("u1")).ok();
        bus.emit(sync_completed()).ok();

        assert_eq!(stream.recv().await.unwrap(), sync_completed());
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(flushed(&format!("u{}", i))).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Pipeline(PipelineEvent::UnitFailed {
            originator_id: "u1".to_string(),
            stage: "upload".to_string(),
            message: "503".to_string(),
        });
        assert_eq!(failed.severity(), EventSeverity::Error);

        let degraded = CoreEvent::Pipeline(PipelineEvent::UnitProcessed {
            originator_id: "u1".to_string(),
            note_path: "notes/2024-01-01/a.md".to_string(),
            pages: 2,
            duration_ms: 1200,
            warnings: 1,
        });
        assert_eq!(degraded.severity(), EventSeverity::Warning);

        let conflict = CoreEvent::Sync(SyncEvent::ConflictDetected {
            path: "a.md".to_string(),
            strategy: "prompt".to_string(),
            resolved: false,
        });
        assert_eq!(conflict.severity(), EventSeverity::Warning);

        assert_eq!(sync_completed().severity(), EventSeverity::Info);
        assert_eq!(flushed("u1").severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_description() {
        assert_eq!(flushed("u1").description(), "Session flushed");
        assert_eq!(sync_completed().description(), "Sync completed successfully");
    }

    #[test]
    fn test_event_serialization() {
        let event = sync_completed();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Sync\""));
        assert!(json.contains("run-1"));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let handle1 = tokio::spawn(async move {
            for i in 0..10 {
                bus1.emit(flushed(&format!("u{}", i))).ok();
            }
        });
        let handle2 = tokio::spawn(async move {
            for _ in 0..10 {
                bus2.emit(sync_completed()).ok();
            }
        });

        handle1.await.ok();
        handle2.await.ok();

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }
}
