//! # Sync Reconciler
//!
//! Mirrors the tracked attachment folder into the version control store.
//!
//! ## Overview
//!
//! Each run:
//! 1. Takes the cross-replica lease ([`SyncLock`]); a held lease skips the run.
//!    A heartbeat renews it every third of its TTL, and a run that loses it
//!    stops before the next file
//! 2. Scans the folder with the [`ChangeDetector`]
//! 3. Walks every pending record (new, modified, deleted or previously failed)
//! 4. Pushes, deletes or settles conflicts per the configured strategy
//! 5. Updates [`SyncStatus`] and emits [`SyncEvent`]s
//!
//! Per-file failures are recorded in the error history and retried on the
//! next run. Only failures that prevent the run as a whole (an unreadable
//! watch root, a broken repository) move the reconciler to `error`.
//!
//! ## Conflicts
//!
//! A remote copy whose fingerprint differs from both the local content and
//! the last synced fingerprint moved independently. Binary attachments are
//! additionally uploaded to the blob store on every push.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{InMemoryFingerprintRepository, SyncReconciler};
//!
//! let reconciler = SyncReconciler::new(&config, Arc::new(InMemoryFingerprintRepository::new()), event_bus)?;
//! reconciler.start().await?;
//!
//! let outcome = reconciler.trigger_manual().await;
//! println!("{:?}", reconciler.status().await.counters);
//! ```

use crate::{
    conflict_resolver::{is_text_path, ConflictResolver, Resolution},
    detector::{fingerprint, ChangeDetector, ChangeSet, PathFilter},
    lock::select_sync_lock,
    repository::{FileRecord, FingerprintRepository},
    status::{ConflictRecord, SyncState, SyncStatus},
    Result, SyncError,
};
use bridge_traits::{
    lock::SyncLock,
    storage::FileSystemAccess,
    time::Clock,
    vcs::{RevisionToken, VersionControlStore, VersionedFile},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_pipeline::{
    assembly::join_remote, quality::detect_format, retry::RetryPolicy, stages::UploadStage, Unit,
};
use core_runtime::config::{ConflictStrategy, NotesConfig, SyncSettings};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Lease name shared by every replica
pub const SYNC_LOCK_NAME: &str = "notes-sync";

/// Originator recorded on blob uploads made by the reconciler
const ATTACHMENT_ORIGINATOR: &str = "attachment-sync";

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another run is in progress in this process
    InProgress,
    Paused,
    /// Another replica holds the lease
    LockHeld,
    /// The lease could not be checked
    LockUnavailable,
}

/// Summary of one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub manual: bool,
    pub changes: ChangeSet,
    pub files_pushed: u64,
    pub files_pulled: u64,
    pub files_deleted: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    /// Files whose sync failed; they stay pending
    pub failed_files: u64,
    pub duration_ms: u64,
}

impl SyncReport {
    fn absorb(&mut self, outcome: FileOutcome) {
        self.files_pushed += outcome.pushed as u64;
        self.files_pulled += outcome.pulled as u64;
        self.files_deleted += outcome.deleted as u64;
        self.conflicts_detected += outcome.conflict_detected as u64;
        self.conflicts_resolved += outcome.conflict_resolved as u64;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(SyncReport),
    Failed { run_id: String, message: String },
    Skipped(SkipReason),
}

impl TickOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped(_))
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            TickOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// What syncing one record did.
#[derive(Debug, Clone, Copy, Default)]
struct FileOutcome {
    pushed: bool,
    pulled: bool,
    deleted: bool,
    conflict_detected: bool,
    conflict_resolved: bool,
}

impl FileOutcome {
    fn in_sync() -> Self {
        Self::default()
    }

    fn pushed() -> Self {
        Self {
            pushed: true,
            ..Self::default()
        }
    }

    fn pulled() -> Self {
        Self {
            pulled: true,
            ..Self::default()
        }
    }

    fn deleted() -> Self {
        Self {
            deleted: true,
            ..Self::default()
        }
    }

    fn merged() -> Self {
        Self {
            pushed: true,
            pulled: true,
            ..Self::default()
        }
    }

    fn unresolved(newly_listed: bool) -> Self {
        Self {
            conflict_detected: newly_listed,
            ..Self::default()
        }
    }

    fn resolved(mut self) -> Self {
        self.conflict_detected = true;
        self.conflict_resolved = true;
        self
    }
}

/// Clears the in-progress flag when a run ends, including on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct TimerTask {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Renews the sync lease in the background while this process works under it.
struct LeaseHeartbeat {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LeaseHeartbeat {
    fn spawn(lock: Arc<dyn SyncLock>, holder: String, ttl: Duration) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let period = (ttl / 3).max(Duration::from_millis(1));
        let (stopped, lost_signal) = (stop.clone(), lost.clone());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut renewed_at = Instant::now();

            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        match lock.try_acquire(SYNC_LOCK_NAME, &holder, ttl).await {
                            Ok(true) => {
                                renewed_at = Instant::now();
                                debug!(holder = %holder, "Sync lease renewed");
                            }
                            Ok(false) => {
                                warn!(holder = %holder, "Sync lease taken over by another replica");
                                lost_signal.cancel();
                                break;
                            }
                            // Keep trying while the next attempt still lands inside the lease
                            Err(e) if renewed_at.elapsed() + period < ttl => {
                                warn!(error = %e, "Failed to renew sync lease, retrying");
                            }
                            Err(e) => {
                                warn!(error = %e, "Sync lease expired without renewal");
                                lost_signal.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop,
            lost,
            handle: Some(handle),
        }
    }

    fn ensure_held(&self) -> Result<()> {
        if self.lost.is_cancelled() {
            return Err(SyncError::LeaseLost {
                name: SYNC_LOCK_NAME.to_string(),
            });
        }
        Ok(())
    }

    /// Stops renewing and waits for an in-flight renewal, so a release that
    /// follows cannot be undone by it.
    async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ============================================================================
// Reconciler
// ============================================================================

struct ReconcilerInner {
    settings: SyncSettings,
    detector: ChangeDetector,
    resolver: ConflictResolver,
    fs: Arc<dyn FileSystemAccess>,
    vcs: Arc<dyn VersionControlStore>,
    upload: UploadStage,
    retry: RetryPolicy,
    lock: Arc<dyn SyncLock>,
    holder_id: String,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    status: RwLock<SyncStatus>,
    running: AtomicBool,
    pause_requested: AtomicBool,
    auto_sync: AtomicBool,
    timer: Mutex<Option<TimerTask>>,
}

impl Drop for ReconcilerInner {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.token.cancel();
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncReconciler {
    inner: Arc<ReconcilerInner>,
}

impl SyncReconciler {
    /// # Errors
    ///
    /// Returns [`SyncError::Pattern`] when an include or exclude pattern does
    /// not compile.
    pub fn new(
        config: &NotesConfig,
        repository: Arc<dyn FingerprintRepository>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let settings = config.sync.clone();
        let retry = RetryPolicy::from_settings(&config.retry);

        let detector = ChangeDetector::new(
            Arc::clone(&config.file_system),
            repository,
            settings.watch_root.clone(),
            PathFilter::from_settings(&settings)?,
            Arc::clone(&config.clock),
        );

        let inner = ReconcilerInner {
            resolver: ConflictResolver::from_settings(&settings),
            status: RwLock::new(SyncStatus::new(
                settings.max_error_history,
                settings.max_conflict_history,
            )),
            auto_sync: AtomicBool::new(settings.auto_sync),
            settings,
            detector,
            fs: Arc::clone(&config.file_system),
            vcs: Arc::clone(&config.version_control),
            upload: UploadStage::new(Arc::clone(&config.blob_store), retry),
            retry,
            lock: select_sync_lock(config),
            holder_id: format!("reconciler-{}", Uuid::new_v4()),
            clock: Arc::clone(&config.clock),
            event_bus,
            running: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            timer: Mutex::new(None),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Identity used when taking the lease
    pub fn holder_id(&self) -> &str {
        &self.inner.holder_id
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.inner.detector
    }

    /// Read-only snapshot
    pub async fn status(&self) -> SyncStatus {
        self.inner.status.read().await.clone()
    }

    /// Timer-driven entry point. A no-op while a run is in progress, while
    /// paused, or while another replica holds the lease.
    pub async fn tick(&self) -> TickOutcome {
        self.run(false).await
    }

    /// Runs immediately, whether or not automatic sync is enabled.
    pub async fn trigger_manual(&self) -> TickOutcome {
        self.run(true).await
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    /// Arms the interval timer.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Paused`] while paused; call [`Self::resume`].
    pub async fn start(&self) -> Result<()> {
        if self.inner.status.read().await.is_paused() {
            return Err(SyncError::Paused);
        }

        self.inner.auto_sync.store(true, Ordering::SeqCst);
        self.arm_timer().await;
        info!(
            interval_secs = self.inner.settings.interval.as_secs(),
            "Automatic sync started"
        );
        Ok(())
    }

    /// Cancels the timer. A run in progress finishes normally.
    pub async fn stop(&self) {
        self.inner.auto_sync.store(false, Ordering::SeqCst);
        self.disarm_timer().await;
        self.inner.status.write().await.next_sync = None;
        info!("Automatic sync stopped");
    }

    pub fn is_auto_sync(&self) -> bool {
        self.inner.auto_sync.load(Ordering::SeqCst)
    }

    /// Stops future runs. A run in progress completes first and the state
    /// becomes `paused` when it ends.
    pub async fn pause(&self) -> Result<()> {
        self.disarm_timer().await;

        let from = {
            let mut status = self.inner.status.write().await;
            status.next_sync = None;
            match status.state {
                SyncState::Paused => return Ok(()),
                SyncState::Syncing => {
                    self.inner.pause_requested.store(true, Ordering::SeqCst);
                    info!("Pause requested, taking effect after the current run");
                    return Ok(());
                }
                _ => status.transition(SyncState::Paused)?,
            }
        };

        self.emit_state_change(from, SyncState::Paused);
        info!("Sync paused");
        Ok(())
    }

    /// Returns to `idle` and re-arms the timer if automatic sync was on.
    pub async fn resume(&self) -> Result<()> {
        let from = {
            let mut status = self.inner.status.write().await;
            // Only touched under the status lock, like pause() and finish()
            self.inner.pause_requested.store(false, Ordering::SeqCst);
            if status.is_paused() {
                Some(status.transition(SyncState::Idle)?)
            } else {
                None
            }
        };

        if let Some(from) = from {
            self.emit_state_change(from, SyncState::Idle);
            info!("Sync resumed");
        }
        if self.is_auto_sync() {
            self.arm_timer().await;
        }
        Ok(())
    }

    async fn arm_timer(&self) {
        let interval = self.inner.settings.interval;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<ReconcilerInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        SyncReconciler { inner }.tick().await;
                    }
                }
            }
            debug!("Sync timer stopped");
        });

        let previous = self.inner.timer.lock().await.replace(TimerTask {
            token,
            _handle: handle,
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let next_sync = next_after(self.inner.clock.now(), interval);
        self.inner.status.write().await.next_sync = next_sync;
    }

    async fn disarm_timer(&self) {
        if let Some(task) = self.inner.timer.lock().await.take() {
            task.token.cancel();
        }
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    #[instrument(skip(self), fields(holder = %self.inner.holder_id))]
    async fn run(&self, manual: bool) -> TickOutcome {
        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress, skipping");
            return TickOutcome::Skipped(SkipReason::InProgress);
        }
        let _running = RunningGuard(&inner.running);

        if inner.status.read().await.is_paused() {
            debug!("Sync paused, skipping");
            return TickOutcome::Skipped(SkipReason::Paused);
        }

        let lease = match self.take_lease().await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!("Sync lease held by another replica, skipping");
                return TickOutcome::Skipped(SkipReason::LockHeld);
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire sync lease");
                let message = SyncError::LockUnavailable {
                    name: SYNC_LOCK_NAME.to_string(),
                }
                .to_string();
                inner.status.write().await.push_error(
                    inner.clock.now(),
                    None,
                    format!("{}: {}", message, e),
                );
                return TickOutcome::Skipped(SkipReason::LockUnavailable);
            }
        };

        let outcome = self.run_locked(manual, &lease).await;
        self.release_lease(lease).await;
        outcome
    }

    /// `Ok(None)` when another replica holds the lease.
    async fn take_lease(&self) -> Result<Option<LeaseHeartbeat>> {
        let inner = &self.inner;
        let ttl = inner.settings.lock_ttl;
        if !inner
            .lock
            .try_acquire(SYNC_LOCK_NAME, &inner.holder_id, ttl)
            .await?
        {
            return Ok(None);
        }
        Ok(Some(LeaseHeartbeat::spawn(
            Arc::clone(&inner.lock),
            inner.holder_id.clone(),
            ttl,
        )))
    }

    async fn release_lease(&self, lease: LeaseHeartbeat) {
        lease.shutdown().await;
        if let Err(e) = self
            .inner
            .lock
            .release(SYNC_LOCK_NAME, &self.inner.holder_id)
            .await
        {
            warn!(error = %e, "Failed to release sync lease");
        }
    }

    async fn run_locked(&self, manual: bool, lease: &LeaseHeartbeat) -> TickOutcome {
        let inner = &self.inner;
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let from = {
            let mut status = inner.status.write().await;
            match status.transition(SyncState::Syncing) {
                Ok(from) => {
                    status.last_run_id = Some(run_id.clone());
                    status.counters.total_runs += 1;
                    from
                }
                // Paused between the check and the transition
                Err(_) if status.is_paused() => {
                    return TickOutcome::Skipped(SkipReason::Paused);
                }
                Err(e) => {
                    return TickOutcome::Failed {
                        run_id,
                        message: e.to_string(),
                    };
                }
            }
        };
        self.emit_state_change(from, SyncState::Syncing);
        self.emit(SyncEvent::Started {
            run_id: run_id.clone(),
            manual,
        });
        info!(run_id = %run_id, manual, "Sync started");

        let result = self.reconcile(&run_id, manual, lease).await;
        self.finish(run_id, started, result).await
    }

    async fn finish(
        &self,
        run_id: String,
        started: Instant,
        result: Result<SyncReport>,
    ) -> TickOutcome {
        let inner = &self.inner;
        let now = inner.clock.now();
        let duration_ms = started.elapsed().as_millis() as u64;

        let settled = if result.is_ok() {
            SyncState::Idle
        } else {
            SyncState::Error
        };

        let (transition, target) = {
            let mut status = inner.status.write().await;
            // Read under the same lock pause() sets it with, so a pause
            // accepted while syncing is never dropped
            let target = if inner.pause_requested.swap(false, Ordering::SeqCst) {
                SyncState::Paused
            } else {
                settled
            };
            let transition = status.transition(target);

            match &result {
                Ok(report) => {
                    status.counters.successful_runs += 1;
                    status.counters.files_pushed += report.files_pushed;
                    status.counters.files_pulled += report.files_pulled;
                    status.counters.files_deleted += report.files_deleted;
                    status.counters.conflicts_detected += report.conflicts_detected;
                    status.counters.conflicts_resolved += report.conflicts_resolved;
                    status.last_sync = Some(now);
                }
                Err(e) => {
                    status.counters.failed_runs += 1;
                    status.push_error(now, None, e.to_string());
                }
            }

            let armed = inner.auto_sync.load(Ordering::SeqCst) && target != SyncState::Paused;
            status.next_sync = if armed {
                next_after(now, inner.settings.interval)
            } else {
                None
            };
            (transition, target)
        };

        match transition {
            Ok(from) => self.emit_state_change(from, target),
            Err(e) => error!(error = %e, "Sync state out of step"),
        }

        match result {
            Ok(mut report) => {
                report.duration_ms = duration_ms;
                info!(
                    run_id = %run_id,
                    pushed = report.files_pushed,
                    pulled = report.files_pulled,
                    deleted = report.files_deleted,
                    conflicts = report.conflicts_detected,
                    failed = report.failed_files,
                    duration_ms,
                    "Sync completed"
                );
                self.emit(SyncEvent::Completed {
                    run_id,
                    files_pushed: report.files_pushed,
                    files_pulled: report.files_pulled,
                    files_deleted: report.files_deleted,
                    conflicts: report.conflicts_detected,
                    duration_ms,
                });
                TickOutcome::Completed(report)
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id = %run_id, error = %message, "Sync failed");
                self.emit(SyncEvent::Failed {
                    run_id: run_id.clone(),
                    message: message.clone(),
                    recoverable: true,
                });
                TickOutcome::Failed { run_id, message }
            }
        }
    }

    async fn reconcile(
        &self,
        run_id: &str,
        manual: bool,
        lease: &LeaseHeartbeat,
    ) -> Result<SyncReport> {
        let detector = &self.inner.detector;
        let changes = detector.scan_all().await?;
        let pending = detector.pending().await?;

        let mut report = SyncReport {
            run_id: run_id.to_string(),
            manual,
            changes,
            ..SyncReport::default()
        };

        for record in pending {
            lease.ensure_held()?;
            match self.sync_record(&record).await {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    warn!(path = %record.path, error = %e, "Failed to sync file");
                    report.failed_files += 1;
                    self.inner.status.write().await.push_error(
                        self.inner.clock.now(),
                        Some(record.path.clone()),
                        e.to_string(),
                    );
                }
            }
        }

        Ok(report)
    }

    async fn sync_record(&self, record: &FileRecord) -> Result<FileOutcome> {
        let remote_path = self.remote_path(&record.path);
        let remote = self.read_remote(&remote_path).await?;

        if record.deleted {
            return self.sync_deletion(record, &remote_path, remote).await;
        }

        let local = self
            .inner
            .fs
            .read_file(&self.inner.detector.absolute(&record.path))
            .await?;
        let local_fingerprint = fingerprint(&local);

        let Some(remote) = remote else {
            self.push(&record.path, &remote_path, local, None).await?;
            return Ok(FileOutcome::pushed());
        };

        let remote_fingerprint = fingerprint(&remote.content);
        if remote_fingerprint == local_fingerprint {
            self.inner
                .detector
                .mark_synced(&record.path, &local_fingerprint, local.len() as u64)
                .await?;
            self.inner.status.write().await.remove_conflict(&record.path);
            return Ok(FileOutcome::in_sync());
        }

        if record.synced_fingerprint.as_deref() == Some(remote_fingerprint.as_str()) {
            self.push(&record.path, &remote_path, local, Some(remote.revision))
                .await?;
            return Ok(FileOutcome::pushed());
        }

        self.handle_conflict(record, &remote_path, Some(local), remote)
            .await
    }

    async fn sync_deletion(
        &self,
        record: &FileRecord,
        remote_path: &str,
        remote: Option<VersionedFile>,
    ) -> Result<FileOutcome> {
        let Some(remote) = remote else {
            self.inner.detector.forget(&record.path).await?;
            return Ok(FileOutcome::in_sync());
        };

        let remote_fingerprint = fingerprint(&remote.content);
        if record.synced_fingerprint.as_deref() != Some(remote_fingerprint.as_str()) {
            return self.handle_conflict(record, remote_path, None, remote).await;
        }

        self.delete_remote(remote_path, remote.revision, &record.path)
            .await?;
        self.inner.detector.forget(&record.path).await?;
        Ok(FileOutcome::deleted())
    }

    async fn handle_conflict(
        &self,
        record: &FileRecord,
        remote_path: &str,
        local: Option<Bytes>,
        remote: VersionedFile,
    ) -> Result<FileOutcome> {
        let resolver = &self.inner.resolver;
        let strategy = resolver.strategy();
        let resolution = resolver.resolve(&record.path, local.as_deref(), &remote.content);

        if resolution == Resolution::Unresolved {
            let conflict = ConflictRecord {
                path: record.path.clone(),
                local_fingerprint: local.as_deref().map(fingerprint),
                remote_fingerprint: fingerprint(&remote.content),
                strategy,
                detected_at: self.inner.clock.now(),
            };
            let newly_listed = self.inner.status.write().await.record_conflict(conflict);
            if newly_listed {
                warn!(path = %record.path, "Conflict left for manual resolution");
                self.emit(SyncEvent::ConflictDetected {
                    path: record.path.clone(),
                    strategy: strategy.to_string(),
                    resolved: false,
                });
            }
            return Ok(FileOutcome::unresolved(newly_listed));
        }

        let outcome = self
            .apply_resolution(&record.path, remote_path, local, Some(remote), resolution)
            .await?;

        self.inner.status.write().await.remove_conflict(&record.path);
        info!(path = %record.path, strategy = %strategy, "Conflict resolved");
        self.emit(SyncEvent::ConflictDetected {
            path: record.path.clone(),
            strategy: strategy.to_string(),
            resolved: true,
        });
        Ok(outcome.resolved())
    }

    async fn apply_resolution(
        &self,
        path: &str,
        remote_path: &str,
        local: Option<Bytes>,
        remote: Option<VersionedFile>,
        resolution: Resolution,
    ) -> Result<FileOutcome> {
        let detector = &self.inner.detector;
        let local_path = detector.absolute(path);

        match resolution {
            Resolution::KeepLocal => match local {
                Some(content) => {
                    self.push(path, remote_path, content, remote.map(|file| file.revision))
                        .await?;
                    Ok(FileOutcome::pushed())
                }
                None => {
                    if let Some(file) = remote {
                        self.delete_remote(remote_path, file.revision, path).await?;
                    }
                    detector.forget(path).await?;
                    Ok(FileOutcome::deleted())
                }
            },
            Resolution::KeepRemote => match remote {
                Some(file) => {
                    self.inner
                        .fs
                        .write_file(&local_path, file.content.clone())
                        .await?;
                    detector
                        .mark_synced(path, &fingerprint(&file.content), file.content.len() as u64)
                        .await?;
                    Ok(FileOutcome::pulled())
                }
                None => {
                    if local.is_some() {
                        self.inner.fs.delete_file(&local_path).await?;
                    }
                    detector.forget(path).await?;
                    Ok(FileOutcome::pulled())
                }
            },
            Resolution::Merged(content) => {
                self.push(
                    path,
                    remote_path,
                    content.clone(),
                    remote.map(|file| file.revision),
                )
                .await?;
                self.inner.fs.write_file(&local_path, content).await?;
                Ok(FileOutcome::merged())
            }
            Resolution::Unresolved => Err(SyncError::InvalidState(format!(
                "conflict on {} has no resolution to apply",
                path
            ))),
        }
    }

    /// Settles a conflict left by the prompt strategy.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnsupportedResolution`] unless `strategy` is keep-local
    ///   or keep-remote
    /// - [`SyncError::ConflictNotFound`] if `path` has no listed conflict
    /// - [`SyncError::SyncInProgress`] while a run is active
    /// - [`SyncError::LockUnavailable`] while another replica holds the lease
    #[instrument(skip(self))]
    pub async fn resolve_conflict(&self, path: &str, strategy: ConflictStrategy) -> Result<()> {
        if !strategy.is_overwrite() {
            return Err(SyncError::UnsupportedResolution {
                strategy: strategy.to_string(),
            });
        }
        if self.inner.status.read().await.conflict(path).is_none() {
            return Err(SyncError::ConflictNotFound {
                path: path.to_string(),
            });
        }

        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let _running = RunningGuard(&inner.running);

        let Some(lease) = self.take_lease().await? else {
            return Err(SyncError::LockUnavailable {
                name: SYNC_LOCK_NAME.to_string(),
            });
        };
        let resolved = self.resolve_locked(path, strategy, &lease).await;
        self.release_lease(lease).await;
        resolved
    }

    async fn resolve_locked(
        &self,
        path: &str,
        strategy: ConflictStrategy,
        lease: &LeaseHeartbeat,
    ) -> Result<()> {
        let inner = &self.inner;
        let record = inner
            .detector
            .record(path)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound {
                path: path.to_string(),
            })?;

        let remote_path = self.remote_path(path);
        let remote = self.read_remote(&remote_path).await?;
        let local = if record.deleted {
            None
        } else {
            Some(inner.fs.read_file(&inner.detector.absolute(path)).await?)
        };

        let resolution = match &remote {
            Some(file) => {
                inner
                    .resolver
                    .resolve_with(strategy, path, local.as_deref(), &file.content)
            }
            None if strategy == ConflictStrategy::KeepLocal => Resolution::KeepLocal,
            None => Resolution::KeepRemote,
        };

        lease.ensure_held()?;
        let outcome = self
            .apply_resolution(path, &remote_path, local, remote, resolution)
            .await?;

        {
            let mut status = inner.status.write().await;
            status.remove_conflict(path);
            status.counters.conflicts_resolved += 1;
            status.counters.files_pushed += outcome.pushed as u64;
            status.counters.files_pulled += outcome.pulled as u64;
            status.counters.files_deleted += outcome.deleted as u64;
        }

        info!(path, "Conflict resolved manually");
        self.emit(SyncEvent::ConflictDetected {
            path: path.to_string(),
            strategy: strategy.to_string(),
            resolved: true,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Remote operations
    // ------------------------------------------------------------------------

    fn remote_path(&self, relative: &str) -> String {
        join_remote(&[self.inner.settings.remote_root.as_str(), relative])
    }

    async fn read_remote(&self, remote_path: &str) -> Result<Option<VersionedFile>> {
        let vcs = &self.inner.vcs;
        let file = self
            .inner
            .retry
            .execute("sync_read", |_| async move { vcs.read_file(remote_path).await })
            .await?;
        Ok(file)
    }

    /// Uploads binaries to the blob store, writes the remote copy and marks
    /// the path synced.
    async fn push(
        &self,
        path: &str,
        remote_path: &str,
        content: Bytes,
        revision: Option<RevisionToken>,
    ) -> Result<()> {
        let inner = &self.inner;

        if !is_text_path(path) {
            let mut unit = Unit::new(ATTACHMENT_ORIGINATOR, path, content.clone(), inner.clock.now());
            if let Some(format) = detect_format(&content) {
                unit = unit.with_mime_type(format.mime_type());
            }
            let uploaded = inner.upload.run(&unit, content.clone()).await?;
            inner.detector.set_blob_url(path, &uploaded.url).await?;
        }

        let vcs = &inner.vcs;
        let message = format!("Sync {}", path);
        inner
            .retry
            .execute("sync_write", |_| {
                let content = content.clone();
                let revision = revision.clone();
                let message = message.as_str();
                async move {
                    vcs.write_file(remote_path, content, revision, message)
                        .await
                }
            })
            .await?;

        inner
            .detector
            .mark_synced(path, &fingerprint(&content), content.len() as u64)
            .await?;
        debug!(path, remote_path, "Pushed file");
        Ok(())
    }

    async fn delete_remote(
        &self,
        remote_path: &str,
        revision: RevisionToken,
        path: &str,
    ) -> Result<()> {
        let vcs = &self.inner.vcs;
        let message = format!("Remove {}", path);
        self.inner
            .retry
            .execute("sync_delete", |_| {
                let revision = revision.clone();
                let message = message.as_str();
                async move { vcs.delete_file(remote_path, revision, message).await }
            })
            .await?;
        debug!(path, remote_path, "Deleted remote file");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    fn emit(&self, event: SyncEvent) {
        self.inner.event_bus.emit(CoreEvent::Sync(event)).ok();
    }

    fn emit_state_change(&self, from: SyncState, to: SyncState) {
        debug!(from = %from, to = %to, "Sync state changed");
        self.emit(SyncEvent::StatusChanged {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
}

fn next_after(now: DateTime<Utc>, interval: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

// ============================================================================
// Tests
// ============================================================================
