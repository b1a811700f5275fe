//! # Notes Service
//!
//! Host-facing facade over the session store, the processing pipeline and
//! the attachment reconciler. All three share one [`EventBus`].
//!
//! ```text
//! OriginTransport ──> NotesService::ingest_item ──> SessionStore
//!                                  │ (expired / ended)
//!                                  ↓
//!                       PipelineCoordinator::process_session
//!
//! timer / host ──────> SyncReconciler::tick
//! ```

use crate::Result;
use bridge_traits::{
    origin::{InboundItem, OriginEvent, OriginTransport},
    time::Clock,
};
use core_pipeline::{
    select_session_store, PipelineCoordinator, PipelineError, ProcessingResult, Session, SessionStore, Unit,
};
use core_runtime::config::{ConflictStrategy, NotesConfig};
use core_runtime::events::{CoreEvent, EventBus, Receiver, SessionEvent, DEFAULT_EVENT_BUFFER_SIZE};
use core_sync::{FingerprintRepository, SyncReconciler, SyncStatus, TickOutcome};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

pub use core_runtime::config::DEFAULT_SWEEP_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Expired,
    Ended,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Expired => "expired",
            FlushReason::Ended => "ended",
        }
    }
}

/// Result of recording one inbound item.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// Units in the originator's live session after the item was added
    pub session_units: usize,
    /// Expired sessions that were processed before the item was added
    pub flushed: Vec<ProcessingResult>,
}

/// Totals for one `run_ingest` loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub items: usize,
    pub sessions_processed: usize,
    pub sessions_failed: usize,
    /// Items or signals that could not be recorded
    pub rejected: usize,
}

impl IngestSummary {
    fn record(&mut self, result: &ProcessingResult) {
        if result.success {
            self.sessions_processed += 1;
        } else {
            self.sessions_failed += 1;
        }
    }
}

struct ServiceInner {
    sessions: Arc<dyn SessionStore>,
    coordinator: PipelineCoordinator,
    reconciler: SyncReconciler,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    /// Originators that may still have a live session
    originators: Mutex<BTreeSet<String>>,
    sweep_interval: Duration,
}

/// Primary facade exposed to host applications. Clones share state.
#[derive(Clone)]
pub struct NotesService {
    inner: Arc<ServiceInner>,
}

impl NotesService {
    /// Wires the session store, pipeline and reconciler from `config`.
    ///
    /// Sessions use the key-value backend when `config.key_value_store` is
    /// set, otherwise an in-process store. `run_ingest` sweeps idle sessions
    /// every `config.sweep_interval`.
    ///
    /// # Errors
    ///
    /// Fails when the reconciler's path filters do not compile.
    pub fn new(config: NotesConfig, repository: Arc<dyn FingerprintRepository>) -> Result<Self> {
        let event_bus = Arc::new(EventBus::new(DEFAULT_EVENT_BUFFER_SIZE));
        let sessions = select_session_store(
            config.key_value_store.clone(),
            config.session_window,
            Arc::clone(&config.clock),
        );
        let coordinator = PipelineCoordinator::new(&config, Arc::clone(&event_bus));
        let reconciler = SyncReconciler::new(&config, repository, Arc::clone(&event_bus))?;

        info!(
            session_window_secs = config.session_window.as_secs(),
            sweep_interval_ms = config.sweep_interval.as_millis() as u64,
            watch_root = ?config.sync.watch_root,
            auto_sync = config.sync.auto_sync,
            "Notes service initialized"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                sessions,
                coordinator,
                reconciler,
                event_bus,
                clock: Arc::clone(&config.clock),
                originators: Mutex::new(BTreeSet::new()),
                sweep_interval: config.sweep_interval,
            }),
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        self.inner.sweep_interval
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.inner.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.event_bus)
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.inner.sessions
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.inner.reconciler
    }

    // ------------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------------

    /// Records one inbound page.
    ///
    /// An expired session for the same originator is processed first, so a
    /// page arriving after the window always starts a new note.
    #[instrument(skip(self, item), fields(originator_id = %item.originator_id, name = %item.name))]
    pub async fn ingest_item(&self, item: InboundItem) -> Result<IngestOutcome> {
        let inner = &self.inner;
        let originator_id = item.originator_id.clone();
        let mut flushed = Vec::new();

        if let Some(expired) = inner
            .sessions
            .close_expired_if_any(&originator_id, inner.clock.now())
            .await
            .map_err(PipelineError::from)?
        {
            flushed.push(self.flush(expired, FlushReason::Expired).await);
        }

        let update = inner
            .sessions
            .add(&originator_id, Unit::from(item))
            .await
            .map_err(PipelineError::from)?;
        let started = update.started_new();
        let session_units = update.session.len();

        // Lost a race with another writer; the store handed it back
        if let Some(expired) = update.flushed {
            flushed.push(self.flush(expired, FlushReason::Expired).await);
        }

        inner.originators.lock().await.insert(originator_id.clone());

        let event = if started {
            SessionEvent::Started { originator_id }
        } else {
            SessionEvent::UnitAdded {
                originator_id,
                unit_count: session_units,
            }
        };
        self.emit(event);

        debug!(session_units, flushed = flushed.len(), "Item recorded");
        Ok(IngestOutcome {
            session_units,
            flushed,
        })
    }

    /// Processes the originator's session regardless of its age.
    ///
    /// Returns `None` when the originator has no live session.
    #[instrument(skip(self))]
    pub async fn end_session(&self, originator_id: &str) -> Result<Option<ProcessingResult>> {
        let session = self
            .inner
            .sessions
            .end_session(originator_id)
            .await
            .map_err(PipelineError::from)?;
        self.inner.originators.lock().await.remove(originator_id);

        match session {
            Some(session) => Ok(Some(self.flush(session, FlushReason::Ended).await)),
            None => {
                debug!("No live session to end");
                Ok(None)
            }
        }
    }

    /// Processes every tracked session whose window has passed.
    ///
    /// A store failure for one originator is logged and retried on the next
    /// sweep.
    pub async fn sweep_expired(&self) -> Vec<ProcessingResult> {
        let inner = &self.inner;
        let originators: Vec<String> = inner.originators.lock().await.iter().cloned().collect();
        let now = inner.clock.now();
        let mut processed = Vec::new();

        for originator_id in originators {
            match inner.sessions.close_expired_if_any(&originator_id, now).await {
                Ok(Some(session)) => {
                    self.forget_if_idle(&originator_id).await;
                    processed.push(self.flush(session, FlushReason::Expired).await);
                }
                Ok(None) => self.forget_if_idle(&originator_id).await,
                Err(e) => {
                    warn!(originator_id = %originator_id, error = %e, "Failed to check session expiry");
                }
            }
        }

        if !processed.is_empty() {
            info!(sessions = processed.len(), "Swept expired sessions");
        }
        processed
    }

    /// Consumes `transport` until it closes.
    ///
    /// Items and session-end signals are dispatched in arrival order. Idle
    /// sessions are swept every sweep interval and once more when the
    /// transport closes. Each processed session is acknowledged to its
    /// originator.
    ///
    /// # Errors
    ///
    /// A transport failure ends the loop and is returned. Failures to record
    /// a single item are counted in [`IngestSummary::rejected`].
    pub async fn run_ingest(&self, transport: Arc<dyn OriginTransport>) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut sweep = tokio::time::interval(self.inner.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        info!("Ingest loop started");
        let mut next_event = transport.next_event();

        loop {
            tokio::select! {
                event = &mut next_event => {
                    next_event = transport.next_event();
                    match event? {
                        None => break,
                        Some(OriginEvent::Item(item)) => {
                            summary.items += 1;
                            match self.ingest_item(item).await {
                                Ok(outcome) => {
                                    for result in &outcome.flushed {
                                        self.acknowledge(transport.as_ref(), result, &mut summary).await;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Rejected inbound item");
                                    summary.rejected += 1;
                                }
                            }
                        }
                        Some(OriginEvent::SessionEnd { originator_id }) => {
                            match self.end_session(&originator_id).await {
                                Ok(Some(result)) => {
                                    self.acknowledge(transport.as_ref(), &result, &mut summary).await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(originator_id = %originator_id, error = %e, "Failed to end session");
                                    summary.rejected += 1;
                                }
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    for result in self.sweep_expired().await {
                        self.acknowledge(transport.as_ref(), &result, &mut summary).await;
                    }
                }
            }
        }

        for result in self.sweep_expired().await {
            self.acknowledge(transport.as_ref(), &result, &mut summary).await;
        }

        info!(
            items = summary.items,
            processed = summary.sessions_processed,
            failed = summary.sessions_failed,
            rejected = summary.rejected,
            "Ingest loop finished"
        );
        Ok(summary)
    }

    /// Stops tracking `originator_id` unless a session was opened meanwhile.
    ///
    /// The store is checked while the set is locked; `ingest_item` records
    /// the unit before taking that lock, so a concurrent page is never lost.
    async fn forget_if_idle(&self, originator_id: &str) {
        let mut originators = self.inner.originators.lock().await;
        match self.inner.sessions.peek(originator_id).await {
            Ok(None) => {
                originators.remove(originator_id);
            }
            Ok(Some(_)) => {}
            Err(e) => {
                debug!(originator_id = %originator_id, error = %e, "Keeping originator tracked");
            }
        }
    }

    async fn flush(&self, session: Session, reason: FlushReason) -> ProcessingResult {
        info!(
            originator_id = %session.originator_id,
            units = session.len(),
            reason = reason.as_str(),
            "Flushing session"
        );
        self.emit(SessionEvent::Flushed {
            originator_id: session.originator_id.clone(),
            unit_count: session.len(),
            reason: reason.as_str().to_string(),
        });
        self.inner.coordinator.process_session(session).await
    }

    async fn acknowledge(
        &self,
        transport: &dyn OriginTransport,
        result: &ProcessingResult,
        summary: &mut IngestSummary,
    ) {
        summary.record(result);

        let message = match (&result.note_path, result.error_message()) {
            (Some(path), _) if result.success => format!("Saved note {}", path),
            (_, Some(error)) => format!("Could not save note: {}", error),
            _ => "Could not save note".to_string(),
        };

        if let Err(e) = transport.acknowledge(&result.originator_id, &message).await {
            warn!(originator_id = %result.originator_id, error = %e, "Failed to acknowledge");
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.event_bus.emit(CoreEvent::Session(event)).ok();
    }

    // ------------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------------

    pub async fn start_sync(&self) -> Result<()> {
        Ok(self.inner.reconciler.start().await?)
    }

    pub async fn stop_sync(&self) {
        self.inner.reconciler.stop().await;
    }

    pub async fn trigger_sync(&self) -> TickOutcome {
        self.inner.reconciler.trigger_manual().await
    }

    pub async fn pause_sync(&self) -> Result<()> {
        Ok(self.inner.reconciler.pause().await?)
    }

    pub async fn resume_sync(&self) -> Result<()> {
        Ok(self.inner.reconciler.resume().await?)
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.inner.reconciler.status().await
    }

    pub async fn resolve_conflict(&self, path: &str, strategy: ConflictStrategy) -> Result<()> {
        Ok(self.inner.reconciler.resolve_conflict(path, strategy).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_reason_labels() {
        assert_eq!(FlushReason::Expired.as_str(), "expired");
        assert_eq!(FlushReason::Ended.as_str(), "ended");
    }
}
