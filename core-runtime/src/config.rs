//! # Core Configuration Module
//!
//! Provides configuration management for the notes processing core.
//!
//! ## Overview
//!
//! Everything the core needs is supplied once, at startup, as a
//! [`NotesConfig`]: timing parameters, retry bounds, sync scope, the conflict
//! strategy, and the collaborator bridges. Nothing reads configuration
//! piecemeal at call time. The builder enforces fail-fast validation so a
//! misconfigured deployment refuses to start instead of failing on the first
//! upload.
//!
//! ## Required Dependencies
//!
//! - `BlobStore` - Page image uploads
//! - `VersionControlStore` - Note publishing and attachment mirroring
//! - `RecognitionService` - Handwriting recognition
//!
//! ## Optional Dependencies (with defaults)
//!
//! - `FileSystemAccess` - Tracked folder I/O (desktop default: tokio fs)
//! - `KeyValueStore` - Shared session state (default: in-process sessions)
//! - `SyncLock` - Cross-replica reconcile lease (default: in-process lease)
//! - `Transcoder` - Image optimization (default: none)
//! - `Clock` - Time source (default: system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{ConflictStrategy, NotesConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = NotesConfig::builder()
//!     .blob_store(Arc::new(MyCdn::new()))
//!     .version_control(Arc::new(MyGitHost::new()))
//!     .recognition(Arc::new(MyOcr::new()))
//!     .session_window(Duration::from_secs(90))
//!     .watch_root("/srv/notes/attachments")
//!     .conflict_strategy(ConflictStrategy::Merge)
//!     .auto_sync(true)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{
    BlobStore, Clock, FileSystemAccess, KeyValueStore, RecognitionService, SyncLock,
    SystemClock, Transcoder, VersionControlStore,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default session aggregation window
pub const DEFAULT_SESSION_WINDOW: Duration = Duration::from_secs(90);

/// How often the ingest loop looks for idle sessions
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Default interval between automatic reconciliations
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

// ============================================================================
// Conflict Strategy
// ============================================================================

/// How the reconciler settles a path that changed both locally and remotely
/// since the last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Overwrite the remote with local content
    KeepLocal,
    /// Overwrite local content with the remote
    KeepRemote,
    /// Line-level merge for text; binary falls back to the configured fallback
    Merge,
    /// Leave unresolved and surface it for manual resolution
    Prompt,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::KeepLocal => "keep-local",
            ConflictStrategy::KeepRemote => "keep-remote",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Prompt => "prompt",
        }
    }

    /// Strategies that settle a conflict without inspecting content
    pub fn is_overwrite(&self) -> bool {
        matches!(self, ConflictStrategy::KeepLocal | ConflictStrategy::KeepRemote)
    }
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::Prompt
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep-local" => Ok(ConflictStrategy::KeepLocal),
            "keep-remote" => Ok(ConflictStrategy::KeepRemote),
            "merge" => Ok(ConflictStrategy::Merge),
            "prompt" => Ok(ConflictStrategy::Prompt),
            other => Err(Error::invalid(
                "conflict_strategy",
                format!(
                    "unknown strategy '{}', expected keep-local, keep-remote, merge or prompt",
                    other
                ),
            )),
        }
    }
}

// ============================================================================
// Settings Groups
// ============================================================================

/// Retry bounds applied to every network-calling stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Double the delay after each failure instead of waiting a fixed time
    pub exponential: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            exponential: true,
        }
    }
}

/// Pipeline behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Write a copy of every page into the version control store
    pub enable_backup: bool,
    /// Reject payloads with an unknown format signature before upload
    pub enable_quality_gate: bool,
    /// Largest accepted payload
    pub max_payload_bytes: usize,
    /// Units processed concurrently within one batch chunk
    pub batch_concurrency: usize,
    /// Pause between batch chunks
    pub inter_batch_delay_ms: u64,
    /// Version control directory for published notes
    pub notes_dir: String,
    /// Version control directory for page backups
    pub backup_dir: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enable_backup: true,
            enable_quality_gate: true,
            max_payload_bytes: 20 * 1024 * 1024,
            batch_concurrency: 3,
            inter_batch_delay_ms: 100,
            notes_dir: "notes".to_string(),
            backup_dir: "backups".to_string(),
        }
    }
}

/// Attachment folder reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub interval: Duration,
    /// Run reconciliation on a timer
    pub auto_sync: bool,
    /// Local folder being tracked
    pub watch_root: PathBuf,
    /// Version control directory mirroring `watch_root`
    pub remote_root: String,
    /// Glob patterns, relative to `watch_root`; empty means everything
    pub include_patterns: Vec<String>,
    /// Glob patterns, relative to `watch_root`
    pub exclude_patterns: Vec<String>,
    pub conflict_strategy: ConflictStrategy,
    /// Used by `Merge` when either side is binary
    pub merge_fallback: ConflictStrategy,
    pub max_error_history: usize,
    pub max_conflict_history: usize,
    /// Lease duration for the cross-replica reconcile lock
    pub lock_ttl: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            auto_sync: false,
            watch_root: PathBuf::from("attachments"),
            remote_root: "attachments".to_string(),
            include_patterns: Vec::new(),
            exclude_patterns: vec![
                ".git/**".to_string(),
                "**/*.partial".to_string(),
                "**/.DS_Store".to_string(),
            ],
            conflict_strategy: ConflictStrategy::default(),
            merge_fallback: ConflictStrategy::KeepLocal,
            max_error_history: 50,
            max_conflict_history: 50,
            lock_ttl: Duration::from_secs(600),
        }
    }
}

// ============================================================================
// NotesConfig
// ============================================================================

/// Core configuration for the notes processing core.
///
/// Use [`NotesConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct NotesConfig {
    /// Inactivity window after which a session is flushed
    pub session_window: Duration,

    /// How often the ingest loop looks for sessions past their window
    pub sweep_interval: Duration,

    pub retry: RetrySettings,

    pub pipeline: PipelineSettings,

    pub sync: SyncSettings,

    /// Page image uploads (required)
    pub blob_store: Arc<dyn BlobStore>,

    /// Note publishing and attachment mirroring (required)
    pub version_control: Arc<dyn VersionControlStore>,

    /// Handwriting recognition (required)
    pub recognition: Arc<dyn RecognitionService>,

    /// Shared session state; in-process sessions when absent
    pub key_value_store: Option<Arc<dyn KeyValueStore>>,

    /// Image optimization applied before upload
    pub transcoder: Option<Arc<dyn Transcoder>>,

    /// Cross-replica reconcile lease; in-process lease when absent
    pub sync_lock: Option<Arc<dyn SyncLock>>,

    /// Tracked folder I/O (optional with desktop default)
    pub file_system: Arc<dyn FileSystemAccess>,

    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for NotesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotesConfig")
            .field("session_window", &self.session_window)
            .field("sweep_interval", &self.sweep_interval)
            .field("retry", &self.retry)
            .field("pipeline", &self.pipeline)
            .field("sync", &self.sync)
            .field("blob_store", &"BlobStore { ... }")
            .field("version_control", &"VersionControlStore { ... }")
            .field("recognition", &"RecognitionService { ... }")
            .field(
                "key_value_store",
                &self
                    .key_value_store
                    .as_ref()
                    .map(|_| "KeyValueStore { ... }"),
            )
            .field(
                "transcoder",
                &self.transcoder.as_ref().map(|_| "Transcoder { ... }"),
            )
            .field(
                "sync_lock",
                &self.sync_lock.as_ref().map(|_| "SyncLock { ... }"),
            )
            .field("file_system", &"FileSystemAccess { ... }")
            .finish()
    }
}

impl NotesConfig {
    /// Creates a new builder for constructing a `NotesConfig`.
    pub fn builder() -> NotesConfigBuilder {
        NotesConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Session window is positive and at most a day
    /// - Sweep interval is positive
    /// - Retry bounds are sane (1-10 attempts, base delay <= max delay <= 5 min)
    /// - Batch concurrency is between 1 and 64
    /// - Sync interval is at least one second
    /// - Include/exclude patterns are valid globs
    /// - The merge fallback is an overwrite strategy
    pub fn validate(&self) -> Result<()> {
        if self.session_window.is_zero() {
            return Err(Error::invalid(
                "session_window",
                "must be greater than zero",
            ));
        }

        if self.session_window > Duration::from_secs(24 * 60 * 60) {
            return Err(Error::invalid("session_window", "exceeds maximum of 24 hours"));
        }

        if self.sweep_interval.is_zero() {
            return Err(Error::invalid("sweep_interval", "must be greater than zero"));
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(Error::invalid(
                "retry.max_attempts",
                format!("must be between 1 and 10, got {}", self.retry.max_attempts),
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::invalid(
                "retry.base_delay_ms",
                format!(
                    "{}ms exceeds max_delay_ms ({}ms)",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            ));
        }

        if self.retry.max_delay_ms > 300_000 {
            return Err(Error::invalid(
                "retry.max_delay_ms",
                "exceeds maximum of 5 minutes (300,000ms)",
            ));
        }

        if !(1..=64).contains(&self.pipeline.batch_concurrency) {
            return Err(Error::invalid(
                "pipeline.batch_concurrency",
                format!(
                    "must be between 1 and 64, got {}",
                    self.pipeline.batch_concurrency
                ),
            ));
        }

        if self.pipeline.max_payload_bytes == 0 {
            return Err(Error::invalid(
                "pipeline.max_payload_bytes",
                "must be greater than zero",
            ));
        }

        if self.pipeline.notes_dir.trim_matches('/').is_empty() {
            return Err(Error::invalid("pipeline.notes_dir", "cannot be empty"));
        }

        if self.pipeline.enable_backup && self.pipeline.backup_dir.trim_matches('/').is_empty() {
            return Err(Error::invalid(
                "pipeline.backup_dir",
                "cannot be empty while backups are enabled",
            ));
        }

        self.validate_sync()
    }

    fn validate_sync(&self) -> Result<()> {
        let sync = &self.sync;

        if sync.interval < Duration::from_secs(1) {
            return Err(Error::invalid("sync.interval", "must be at least 1 second"));
        }

        if sync.watch_root.as_os_str().is_empty() {
            return Err(Error::invalid("sync.watch_root", "cannot be empty"));
        }

        for pattern in sync.include_patterns.iter().chain(&sync.exclude_patterns) {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::invalid(
                    "sync.include_patterns",
                    format!("invalid glob '{}': {}", pattern, e),
                )
            })?;
        }

        if !sync.merge_fallback.is_overwrite() {
            return Err(Error::invalid(
                "sync.merge_fallback",
                format!(
                    "must be keep-local or keep-remote, got {}",
                    sync.merge_fallback
                ),
            ));
        }

        if sync.max_error_history == 0 || sync.max_conflict_history == 0 {
            return Err(Error::invalid(
                "sync.max_error_history",
                "history caps must be at least 1",
            ));
        }

        if sync.lock_ttl.is_zero() {
            return Err(Error::invalid("sync.lock_ttl", "must be greater than zero"));
        }

        Ok(())
    }
}

fn capability_missing(capability: &str, message: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: message.to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(watch_root: &Path) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::with_root(watch_root.to_path_buf()));
    Ok(fs)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_watch_root: &Path) -> Result<Arc<dyn FileSystemAccess>> {
    Err(capability_missing(
        "FileSystemAccess",
        "FileSystemAccess implementation is required to scan the tracked folder. \
         Desktop: enable the 'desktop-shims' feature to use TokioFileSystem. \
         Other hosts: inject an implementation with .file_system().",
    ))
}

/// Builder for constructing [`NotesConfig`] instances.
#[derive(Default)]
pub struct NotesConfigBuilder {
    session_window: Option<Duration>,
    sweep_interval: Option<Duration>,
    retry: RetrySettings,
    pipeline: PipelineSettings,
    sync: SyncSettings,
    blob_store: Option<Arc<dyn BlobStore>>,
    version_control: Option<Arc<dyn VersionControlStore>>,
    recognition: Option<Arc<dyn RecognitionService>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    transcoder: Option<Arc<dyn Transcoder>>,
    sync_lock: Option<Arc<dyn SyncLock>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    clock: Option<Arc<dyn Clock>>,
}

impl NotesConfigBuilder {
    pub fn session_window(mut self, window: Duration) -> Self {
        self.session_window = Some(window);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineSettings) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn enable_backup(mut self, enabled: bool) -> Self {
        self.pipeline.enable_backup = enabled;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync.interval = interval;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.sync.auto_sync = enabled;
        self
    }

    pub fn watch_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sync.watch_root = path.into();
        self
    }

    pub fn include_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.sync.include_patterns.push(pattern.into());
        self
    }

    pub fn exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.sync.exclude_patterns.push(pattern.into());
        self
    }

    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.sync.conflict_strategy = strategy;
        self
    }

    /// Lease length; a run renews it every third of this
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.sync.lock_ttl = ttl;
        self
    }

    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn version_control(mut self, store: Arc<dyn VersionControlStore>) -> Self {
        self.version_control = Some(store);
        self
    }

    pub fn recognition(mut self, service: Arc<dyn RecognitionService>) -> Self {
        self.recognition = Some(service);
        self
    }

    /// Shared store for sessions and the reconcile lease.
    ///
    /// Required when more than one replica ingests for the same originators.
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn sync_lock(mut self, lock: Arc<dyn SyncLock>) -> Self {
        self.sync_lock = Some(lock);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the final `NotesConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(NotesConfig)` on success, or an error if:
    /// - A required bridge is missing (BlobStore, VersionControlStore, RecognitionService)
    /// - No FileSystemAccess was injected and no desktop default is available
    /// - A setting is out of range
    pub fn build(self) -> Result<NotesConfig> {
        let blob_store = self.blob_store.ok_or_else(|| {
            capability_missing(
                "BlobStore",
                "BlobStore implementation is required to upload page images. \
                 Inject one with .blob_store().",
            )
        })?;

        let version_control = self.version_control.ok_or_else(|| {
            capability_missing(
                "VersionControlStore",
                "VersionControlStore implementation is required to publish notes. \
                 Inject one with .version_control().",
            )
        })?;

        let recognition = self.recognition.ok_or_else(|| {
            capability_missing(
                "RecognitionService",
                "RecognitionService implementation is required to transcribe pages. \
                 Inject one with .recognition().",
            )
        })?;

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&self.sync.watch_root)?,
        };

        let config = NotesConfig {
            session_window: self.session_window.unwrap_or(DEFAULT_SESSION_WINDOW),
            sweep_interval: self.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL),
            retry: self.retry,
            pipeline: self.pipeline,
            sync: self.sync,
            blob_store,
            version_control,
            recognition,
            key_value_store: self.key_value_store,
            transcoder: self.transcoder,
            sync_lock: self.sync_lock,
            file_system,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}
